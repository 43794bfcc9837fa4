// FrrLab: External BGP speaker and cluster sampling for route-advertisement tests
// Copyright (C) 2022-2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::{ffi::OsString, path::PathBuf};

use pretty_assertions::assert_eq;
use test_log::test;

use crate::{
    config::HostConfig,
    ssh::{connection_options, shell_quote},
};

#[test]
fn quote_plain_arguments() {
    assert_eq!(shell_quote("show"), "show");
    assert_eq!(shell_quote("name=^frr-lab-x1$"), "'name=^frr-lab-x1$'");
    assert_eq!(shell_quote("/tmp/frr-lab.abc:/etc/frr"), "/tmp/frr-lab.abc:/etc/frr");
}

#[test]
fn quote_shell_syntax() {
    assert_eq!(shell_quote(""), "''");
    assert_eq!(shell_quote("show ip bgp"), "'show ip bgp'");
    assert_eq!(shell_quote("it's"), r"'it'\''s'");
}

#[test]
fn options_from_host_config() {
    let mut host = HostConfig::new("frr-host");
    assert_eq!(connection_options(&host).len(), 4);

    host.user = Some("core".to_string());
    host.identity_file = Some(PathBuf::from("/root/.ssh/id_lab"));
    let options = connection_options(&host);
    assert_eq!(
        &options[4..],
        &[
            OsString::from("-oUser=core"),
            OsString::from("-oIdentityFile=/root/.ssh/id_lab"),
        ]
    );
}
