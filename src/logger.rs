// Copyright (c) 2023 Beihang University, Huawei Technologies Co.,Ltd. All rights reserved.
// Rust-AxpMem is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//          http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND,
// EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT,
// MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

use core::fmt;

use log::{Level, Metadata, Record};
use log::{LevelFilter, SetLoggerError};
use spin::Once;

/// Where formatted records go. The core has no console of its own; the
/// frontend hands one line at a time to whatever it writes on.
pub type LogSink = fn(fmt::Arguments);

struct SimpleLogger;

static SINK: Once<LogSink> = Once::new();

fn level2color(level: Level) -> u8 {
    match level {
        Level::Error => 31, // 31 Red
        Level::Warn => 93,  // 93 BrightYellow
        Level::Info => 34,  // 34 Blue
        Level::Debug => 32, // 32 Green
        Level::Trace => 90, // 90 BrightBlack
    }
}

macro_rules! with_color {
    ($color: expr, $($arg:tt)*) => {
        format_args!("\u{1B}[{}m{}\u{1B}[0m", $color as u8, format_args!($($arg)*))
    };
}

impl log::Log for SimpleLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let sink = match SINK.get() {
                Some(sink) => *sink,
                None => return,
            };
            let level = match record.level() {
                Level::Error => "[E]",
                Level::Warn => "[W]",
                Level::Info => "[I]",
                Level::Debug => "[D]",
                Level::Trace => "[T]",
            };
            sink(with_color!(
                level2color(record.level()),
                "{}>[{}, {}:{}] {}\n",
                level,
                record.target(),
                record.file().unwrap_or("Unknown File"),
                record.line().unwrap_or(0),
                record.args()
            ));
        }
    }

    fn flush(&self) {}
}

static LOGGER: SimpleLogger = SimpleLogger;

/// Initialize global logger, setting log level to `Trace`.
pub fn logger_init(sink: LogSink) -> Result<(), SetLoggerError> {
    SINK.call_once(|| sink);
    log::set_logger(&LOGGER).map(|()| log::set_max_level(LevelFilter::Trace))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_colors_are_ansi() {
        for level in [Level::Error, Level::Warn, Level::Info, Level::Debug, Level::Trace] {
            assert!((30..=97).contains(&level2color(level)));
        }
    }
}
