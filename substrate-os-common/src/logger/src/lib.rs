// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A [`log::Log`] sink that ships formatted records to a well-known log
//! server endpoint instead of printing locally -- every domain on this
//! substrate is headless, so diagnostics have to leave the domain somehow.

#![cfg_attr(not(test), no_std)]
#![feature(const_mut_refs)]

use core::str::from_utf8_unchecked;
use core2::io::{Cursor, Write};
use log::{Metadata, Record};
use num_enum::{FromPrimitive, IntoPrimitive};
pub use paste::*; // re-export for macros
use serde::{Deserialize, Serialize};
use spin::Mutex;
use substrate_kernel_sys::{Capref, Invocation, SyscallGate};

pub const MAX_MSG_LEN: usize = 2048;

#[repr(usize)]
#[derive(Debug, Default, Eq, PartialEq, FromPrimitive, IntoPrimitive)]
pub enum LoggerError {
    Success = 0,
    SerializeFailed,
    DeserializeFailed,
    LogFailed,
    #[default]
    UnknownError,
}
impl From<LoggerError> for Result<(), LoggerError> {
    fn from(err: LoggerError) -> Result<(), LoggerError> {
        if err == LoggerError::Success { Ok(()) } else { Err(err) }
    }
}

/// Installs a [`SubstrateLogger`] backed by `$gate` and the well-known log
/// endpoint/scratch buffer a component's glue code exposes under
/// `<TAG>_INTERFACE_ENDPOINT`/`<TAG>_INTERFACE_DATA`.
#[macro_export]
macro_rules! static_logger {
    ($gate:expr, $inf_tag:ident) => {
        static_logger!($gate, $inf_tag, log::LevelFilter::Trace);
    };
    ($gate:expr, $inf_tag:ident, $inf_level:expr) => {
        $crate::paste! {
            static SUBSTRATE_LOGGER: logger::SubstrateLogger = logger::SubstrateLogger::new(
                $gate,
                [<$inf_tag:upper _INTERFACE_ENDPOINT>],
                unsafe { &mut [<$inf_tag:upper _INTERFACE_DATA>].data },
            );
            log::set_logger(&SUBSTRATE_LOGGER).unwrap();
            log::set_max_level($inf_level);
        }
    };
}

#[derive(Debug, Serialize, Deserialize)]
pub enum LoggerRequest<'a> {
    Log { level: u8, msg: &'a str },
}

pub struct SubstrateLogger {
    gate: &'static dyn SyscallGate,
    endpoint: Capref,
    buffer: Mutex<&'static mut [u8]>,
}
impl SubstrateLogger {
    pub const fn new(gate: &'static dyn SyscallGate, endpoint: Capref, buffer: &'static mut [u8]) -> Self {
        Self { gate, endpoint, buffer: Mutex::new(buffer) }
    }
}
impl log::Log for SubstrateLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool { true }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // TODO: split self.buffer instead of using the stack.
        let mut buf = [0u8; MAX_MSG_LEN];
        let mut cur = Cursor::new(&mut buf[..]);
        // Log msgs are of the form: '<target>::<fmt'd-msg>'
        write!(&mut cur, "{}::{}", record.target(), record.args()).unwrap_or_else(|_| {
            // Too big, indicate overflow with a trailing "...".
            cur.set_position((MAX_MSG_LEN - 3) as u64);
            cur.write(b"...").expect("write!");
        });
        let pos = cur.position() as usize;

        let _ = postcard::to_slice(
            &LoggerRequest::Log {
                level: record.level() as u8,
                msg: unsafe { from_utf8_unchecked(&buf[..pos]) },
            },
            *self.buffer.lock(),
        )
        .map(|_| self.gate.invoke(Invocation::LmpSend, self.endpoint, &[]));
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use substrate_kernel_sys::KernelError;

    struct NullGate;
    impl SyscallGate for NullGate {
        fn invoke(&self, _op: Invocation, _target: Capref, _args: &[usize]) -> (usize, KernelError) {
            (0, KernelError::NoError)
        }
    }
    static GATE: NullGate = NullGate;
    static mut BUF: [u8; MAX_MSG_LEN] = [0u8; MAX_MSG_LEN];

    #[test]
    fn logs_without_panicking() {
        let logger = SubstrateLogger::new(&GATE, Capref::NULL, unsafe { &mut BUF });
        logger.log(&Record::builder().args(format_args!("hi")).level(log::Level::Info).target("t").build());
    }

    #[test]
    fn overlong_message_is_truncated_with_ellipsis() {
        let logger = SubstrateLogger::new(&GATE, Capref::NULL, unsafe { &mut BUF });
        let long = "x".repeat(MAX_MSG_LEN * 2);
        logger.log(&Record::builder().args(format_args!("{}", long)).level(log::Level::Debug).target("t").build());
    }
}
