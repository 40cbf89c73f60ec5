// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Structured logging setup, shared by all the daemons and test harnesses
//! in this workspace.

use std::fs::OpenOptions;
use std::sync::Mutex;

use anyhow::Context;
use slog::Drain;

/// The on-the-wire format of emitted log records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// Colorized, human-readable output for a terminal.
    Human,
    /// Bunyan-style newline-delimited JSON for log collection.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(LogFormat::Human),
            "json" => Ok(LogFormat::Json),
            x => Err(anyhow::anyhow!("invalid log format: {x}")),
        }
    }
}

fn human_drain<D>(decorator: D) -> slog::Fuse<slog_async::Async>
where
    D: slog_term::Decorator + Send + 'static,
{
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog_async::Async::new(drain)
        .chan_size(0x8000)
        .build()
        .fuse()
}

/// Build the root [`slog::Logger`] for a process.
///
/// With `log_file` set, records go to that file in the requested format.
/// Without it, human-format records go to the terminal and json records to
/// stdout.
pub fn init(
    name: &'static str,
    log_file: &Option<String>,
    log_format: LogFormat,
) -> anyhow::Result<slog::Logger> {
    let drain = match log_file {
        Some(log_file) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .with_context(|| {
                    format!("failed to open log file {log_file:?}")
                })?;
            match log_format {
                LogFormat::Human => {
                    human_drain(slog_term::PlainDecorator::new(file))
                }
                LogFormat::Json => {
                    let drain =
                        Mutex::new(slog_bunyan::with_name(name, file).build())
                            .fuse();
                    slog_async::Async::new(drain)
                        .chan_size(0x8000)
                        .build()
                        .fuse()
                }
            }
        }
        None => match log_format {
            LogFormat::Human => human_drain(slog_term::TermDecorator::new()
                .build()),
            LogFormat::Json => {
                let drain = Mutex::new(
                    slog_bunyan::with_name(name, std::io::stdout()).build(),
                )
                .fuse();
                slog_async::Async::new(drain)
                    .chan_size(0x8000)
                    .build()
                    .fuse()
            }
        },
    };

    Ok(slog::Logger::root(drain, slog::o!()))
}
