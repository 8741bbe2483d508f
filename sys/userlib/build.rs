// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::env;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Unlike a multi-subprofile ARM Cortex-M target, every tile on this mesh
    // is the same RISC-V core, so there's no M-profile cfg fan-out to expose
    // here -- just the board config build_util already handles.
    build_util::expose_target_board();

    // Do an architecture check.
    if env::var("CARGO_CFG_TARGET_OS").unwrap() != "none" {
        eprintln!("***********************************************");
        eprintln!("Hi!");
        eprintln!("You appear to be building this natively,");
        eprintln!("i.e. for your workstation. This won't work.");
        eprintln!("Please specify --target=some-triple, e.g.");
        eprintln!("--target=riscv32im-unknown-none-elf");
        eprintln!("***********************************************");
        panic!()
    }

    Ok(())
}
