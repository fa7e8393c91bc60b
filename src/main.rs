// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

mod cli;

fn main() {
    if let Err(e) = cli::run() {
        ::log::error!("{e}");
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
