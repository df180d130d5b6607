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

//! Standard I/O plumbing for a domain: if the init domain handed this one
//! mapped STDIN/STDOUT frame capabilities, route `read`/`write` through UMP
//! channels built on them; otherwise fall back to the init RPC's
//! get-character/put-string calls. Either way, callers see a plain
//! byte-oriented `read`/`write` regardless of which transport is live
//! underneath.
#![cfg_attr(not(test), no_std)]

use substrate_kernel_sys::Capref;
use substrate_rpc::FrameTransport;

const READ_BUF_SIZE: usize = 4096;

/// The serial fallback used when no STDIN/STDOUT frame was mapped for this
/// domain -- typically the init RPC's serial get-character/put-string pair.
pub trait SerialChannel {
    fn get_str(&mut self, buf: &mut [u8]) -> usize;
    fn put_str(&mut self, buf: &[u8]) -> usize;
}

enum Input<T: FrameTransport> {
    Ump(T),
    Serial,
}

enum Output<T: FrameTransport> {
    Ump(T),
    Serial,
}

/// Standard I/O for one domain. `stdin`/`stdout` are `Some` exactly when
/// the corresponding TASKCN frame was mapped at startup; `serial` backs
/// whichever direction wasn't.
pub struct IoChannel<T: FrameTransport, S: SerialChannel> {
    input: Input<T>,
    output: Output<T>,
    serial: S,
    read_buf: [u8; READ_BUF_SIZE],
    read_buf_begin: usize,
    read_buf_end: usize,
}

impl<T: FrameTransport, S: SerialChannel> IoChannel<T, S> {
    pub fn new(stdin: Option<T>, stdout: Option<T>, serial: S) -> Self {
        IoChannel {
            input: match stdin {
                Some(t) => Input::Ump(t),
                None => Input::Serial,
            },
            output: match stdout {
                Some(t) => Output::Ump(t),
                None => Output::Serial,
            },
            serial,
            read_buf: [0u8; READ_BUF_SIZE],
            read_buf_begin: 0,
            read_buf_end: 0,
        }
    }

    fn refill(&mut self) -> bool {
        let transport = match &mut self.input {
            Input::Ump(t) => t,
            Input::Serial => return false,
        };
        match transport.recv_frame(&mut self.read_buf) {
            Ok((len, _cap, _more)) if len > 0 => {
                self.read_buf_begin = 0;
                self.read_buf_end = len;
                true
            }
            _ => false,
        }
    }

    /// Reads up to `buf.len()` bytes, satisfying the request from the
    /// internal read-ahead buffer first and only blocking on a fresh UMP
    /// fragment once that buffer is empty.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        if matches!(self.input, Input::Serial) {
            return self.serial.get_str(buf);
        }
        if self.read_buf_begin == self.read_buf_end && !self.refill() {
            return 0;
        }
        let available = self.read_buf_end - self.read_buf_begin;
        let take = available.min(buf.len());
        buf[..take].copy_from_slice(&self.read_buf[self.read_buf_begin..self.read_buf_begin + take]);
        self.read_buf_begin += take;
        take
    }

    pub fn write(&mut self, buf: &[u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        match &mut self.output {
            Output::Serial => self.serial.put_str(buf),
            Output::Ump(t) => match t.send_frame(buf, None, false) {
                Ok(()) => buf.len(),
                Err(_) => 0,
            },
        }
    }

    /// Sends an EOF marker (a single null byte) on the UMP-backed output
    /// direction, matching the original's ad hoc out-of-band signal for
    /// "this domain is exiting".
    pub fn destroy(&mut self) {
        if let Output::Ump(t) = &mut self.output {
            let _ = t.send_frame(&[0u8], None, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use substrate_rpc::RpcError;

    struct LoopbackUmp {
        inbox: Vec<(Vec<u8>, bool)>,
        outbox: Vec<Vec<u8>>,
    }
    impl FrameTransport for LoopbackUmp {
        fn max_frame(&self) -> usize { 4096 }
        fn send_frame(&mut self, data: &[u8], _cap: Option<Capref>, _more: bool) -> Result<(), RpcError> {
            self.outbox.push(data.to_vec());
            Ok(())
        }
        fn recv_frame(&mut self, buf: &mut [u8]) -> Result<(usize, Option<Capref>, bool), RpcError> {
            let (data, more) = self.inbox.pop().ok_or(RpcError::NotReady)?;
            buf[..data.len()].copy_from_slice(&data);
            Ok((data.len(), None, more))
        }
    }

    struct NeverCalledSerial;
    impl SerialChannel for NeverCalledSerial {
        fn get_str(&mut self, _buf: &mut [u8]) -> usize { panic!("serial fallback should not be used") }
        fn put_str(&mut self, _buf: &[u8]) -> usize { panic!("serial fallback should not be used") }
    }

    struct FakeSerial {
        to_read: Vec<u8>,
        written: Vec<u8>,
    }
    impl SerialChannel for FakeSerial {
        fn get_str(&mut self, buf: &mut [u8]) -> usize {
            let take = self.to_read.len().min(buf.len());
            buf[..take].copy_from_slice(&self.to_read[..take]);
            self.to_read.drain(..take);
            take
        }
        fn put_str(&mut self, buf: &[u8]) -> usize {
            self.written.extend_from_slice(buf);
            buf.len()
        }
    }

    #[test]
    fn reads_are_served_from_read_ahead_buffer_across_calls() {
        let stdin = LoopbackUmp { inbox: vec![(b"hello world".to_vec(), false)], outbox: Vec::new() };
        let mut io = IoChannel::new(Some(stdin), None::<LoopbackUmp>, FakeSerial { to_read: Vec::new(), written: Vec::new() });
        let mut first = [0u8; 5];
        assert_eq!(io.read(&mut first), 5);
        assert_eq!(&first, b"hello");
        let mut second = [0u8; 16];
        let n = io.read(&mut second);
        assert_eq!(&second[..n], b" world");
    }

    #[test]
    fn write_without_stdout_frame_falls_back_to_serial() {
        let mut io = IoChannel::new(
            None::<LoopbackUmp>,
            None::<LoopbackUmp>,
            FakeSerial { to_read: Vec::new(), written: Vec::new() },
        );
        assert_eq!(io.write(b"hi"), 2);
        assert_eq!(io.serial.written, b"hi");
    }

    #[test]
    fn destroy_sends_null_byte_eof_marker_on_mapped_stdout() {
        let stdout = LoopbackUmp { inbox: Vec::new(), outbox: Vec::new() };
        let mut io = IoChannel::new(None::<LoopbackUmp>, Some(stdout), NeverCalledSerial);
        io.destroy();
        if let Output::Ump(t) = &io.output {
            assert_eq!(t.outbox, vec![vec![0u8]]);
        } else {
            panic!("expected mapped stdout");
        }
    }

    #[test]
    fn read_with_no_stdin_frame_uses_serial_fallback() {
        let mut io = IoChannel::new(
            None::<LoopbackUmp>,
            None::<LoopbackUmp>,
            FakeSerial { to_read: b"ok".to_vec(), written: Vec::new() },
        );
        let mut buf = [0u8; 8];
        let n = io.read(&mut buf);
        assert_eq!(&buf[..n], b"ok");
    }
}
