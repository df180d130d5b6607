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

//! Thin client for the process manager living behind the init RPC channel:
//! every call here encodes a request enum, sends it over a
//! [`substrate_rpc::FrameTransport`], and decodes the matching response.
//! None of the actual process bookkeeping lives in this crate -- it's all
//! on the other end of the channel; this is marshalling only.
#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::string::String;
use alloc::vec::Vec;
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};

use substrate_cmdline::make_argv;
use substrate_kernel_sys::Capref;
use substrate_rpc::{recv_message, send_message, FrameTransport, RpcError};

#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
pub enum ProcessManagerError {
    Success = 0,
    InvalidSpawnd,
    SpawndRequest,
    ProcessNotFound,
    Serialize,
    Deserialize,
    #[num_enum(default)]
    Unknown,
}
impl From<RpcError> for ProcessManagerError {
    fn from(_: RpcError) -> Self { ProcessManagerError::SpawndRequest }
}
impl core::fmt::Display for ProcessManagerError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Debug::fmt(self, f)
    }
}

/// Serializable stand-in for [`Capref`] (which carries no serde impls of
/// its own, since most of the workspace never needs to put one on the
/// wire): the four fields that name a capability, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapDescriptor {
    pub root: usize,
    pub cnode: usize,
    pub slot: usize,
    pub depth: u8,
}
impl From<Capref> for CapDescriptor {
    fn from(c: Capref) -> Self { CapDescriptor { root: c.root, cnode: c.cnode, slot: c.slot, depth: c.depth } }
}
impl From<CapDescriptor> for Capref {
    fn from(d: CapDescriptor) -> Self { Capref { root: d.root, cnode: d.cnode, slot: d.slot, depth: d.depth } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcState {
    Unknown,
    Spawning,
    Running,
    Paused,
    Exited,
    Killed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcStatus {
    pub pid: u32,
    pub cmdline: String,
    pub state: ProcState,
    pub exit_code: i32,
}

#[derive(Debug, Serialize, Deserialize)]
enum Request {
    SpawnWithCaps { argv: Vec<String>, capv: Vec<CapDescriptor> },
    SpawnMapped { argv: Vec<String>, capv: Vec<CapDescriptor>, stdin: Option<CapDescriptor>, stdout: Option<CapDescriptor> },
    SpawnWithCmdline { cmdline: String },
    SpawnProgram { path: String },
    List,
    GetStatus { pid: u32 },
    GetName { pid: u32 },
    GetPidByName { name: String },
    Suspend { pid: u32 },
    Resume { pid: u32 },
    Exit { status: i32 },
    Wait { pid: u32 },
    Kill { pid: u32 },
    KillAll { name: String },
    CapScan { pid: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
enum Response {
    Pid(u32),
    Ack,
    Status(ProcStatus),
    Name(String),
    Pids(Vec<u32>),
    ExitCode(i32),
    Err(ProcessManagerError),
}

fn call(transport: &mut impl FrameTransport, request: &Request) -> Result<Response, ProcessManagerError> {
    let bytes = postcard::to_allocvec(request).map_err(|_| ProcessManagerError::Serialize)?;
    send_message(transport, &bytes)?;
    let reply = recv_message(transport)?;
    postcard::from_bytes(&reply).map_err(|_| ProcessManagerError::Deserialize)
}

fn expect<T>(resp: Response, f: impl FnOnce(Response) -> Option<T>) -> Result<T, ProcessManagerError> {
    if let Response::Err(e) = resp {
        return Err(e);
    }
    f(resp).ok_or(ProcessManagerError::Unknown)
}

/// Implements every operation the process manager's client surface offers,
/// including the supplemental `get_pid_by_name`/`kill_all`/`capscan` debug
/// hook beyond plain spawn/wait/kill.
pub trait ProcessManagerInterface {
    fn spawn_with_caps(&mut self, argv: &[String], capv: &[Capref]) -> Result<u32, ProcessManagerError>;
    fn spawn_mapped(
        &mut self,
        argv: &[String],
        capv: &[Capref],
        stdin: Option<Capref>,
        stdout: Option<Capref>,
    ) -> Result<u32, ProcessManagerError>;
    fn spawn_with_cmdline(&mut self, cmdline: &str) -> Result<u32, ProcessManagerError>;
    fn spawn_program(&mut self, path: &str) -> Result<u32, ProcessManagerError>;
    fn list(&mut self) -> Result<Vec<u32>, ProcessManagerError>;
    fn get_status(&mut self, pid: u32) -> Result<ProcStatus, ProcessManagerError>;
    fn get_name(&mut self, pid: u32) -> Result<String, ProcessManagerError>;
    fn get_pid_by_name(&mut self, name: &str) -> Result<u32, ProcessManagerError>;
    fn suspend(&mut self, pid: u32) -> Result<(), ProcessManagerError>;
    fn resume(&mut self, pid: u32) -> Result<(), ProcessManagerError>;
    fn exit(&mut self, status: i32) -> Result<(), ProcessManagerError>;
    fn wait(&mut self, pid: u32) -> Result<i32, ProcessManagerError>;
    fn kill(&mut self, pid: u32) -> Result<(), ProcessManagerError>;
    fn kill_all(&mut self, name: &str) -> Result<(), ProcessManagerError>;
    fn capscan(&mut self, pid: u32) -> Result<(), ProcessManagerError>;
}

/// Wraps a point-to-point transport (typically an `LmpChannel` to the init
/// domain) with the process manager's request/response protocol.
pub struct ProcClient<'a, T: FrameTransport> {
    transport: &'a mut T,
}

impl<'a, T: FrameTransport> ProcClient<'a, T> {
    pub fn new(transport: &'a mut T) -> Self { ProcClient { transport } }

    /// Concatenating `argv` yields the command line of the spawned process,
    /// matching the note on the original interface.
    pub fn spawn_with_argv(&mut self, argv: &[String]) -> Result<u32, ProcessManagerError> {
        let cmdline = substrate_cmdline::make_cmdline(argv);
        self.spawn_with_cmdline(&cmdline)
    }
}

impl<'a, T: FrameTransport> ProcessManagerInterface for ProcClient<'a, T> {
    fn spawn_with_caps(&mut self, argv: &[String], capv: &[Capref]) -> Result<u32, ProcessManagerError> {
        let req = Request::SpawnWithCaps {
            argv: argv.to_vec(),
            capv: capv.iter().map(|&c| c.into()).collect(),
        };
        let resp = call(self.transport, &req)?;
        expect(resp, |r| if let Response::Pid(pid) = r { Some(pid) } else { None })
    }

    fn spawn_mapped(
        &mut self,
        argv: &[String],
        capv: &[Capref],
        stdin: Option<Capref>,
        stdout: Option<Capref>,
    ) -> Result<u32, ProcessManagerError> {
        let req = Request::SpawnMapped {
            argv: argv.to_vec(),
            capv: capv.iter().map(|&c| c.into()).collect(),
            stdin: stdin.map(CapDescriptor::from),
            stdout: stdout.map(CapDescriptor::from),
        };
        let resp = call(self.transport, &req)?;
        expect(resp, |r| if let Response::Pid(pid) = r { Some(pid) } else { None })
    }

    fn spawn_with_cmdline(&mut self, cmdline: &str) -> Result<u32, ProcessManagerError> {
        let _ = make_argv(cmdline); // validates the command line parses before it's sent
        let resp = call(self.transport, &Request::SpawnWithCmdline { cmdline: String::from(cmdline) })?;
        expect(resp, |r| if let Response::Pid(pid) = r { Some(pid) } else { None })
    }

    fn spawn_program(&mut self, path: &str) -> Result<u32, ProcessManagerError> {
        let resp = call(self.transport, &Request::SpawnProgram { path: String::from(path) })?;
        expect(resp, |r| if let Response::Pid(pid) = r { Some(pid) } else { None })
    }

    fn list(&mut self) -> Result<Vec<u32>, ProcessManagerError> {
        let resp = call(self.transport, &Request::List)?;
        expect(resp, |r| if let Response::Pids(pids) = r { Some(pids) } else { None })
    }

    fn get_status(&mut self, pid: u32) -> Result<ProcStatus, ProcessManagerError> {
        let resp = call(self.transport, &Request::GetStatus { pid })?;
        expect(resp, |r| if let Response::Status(s) = r { Some(s) } else { None })
    }

    fn get_name(&mut self, pid: u32) -> Result<String, ProcessManagerError> {
        let resp = call(self.transport, &Request::GetName { pid })?;
        expect(resp, |r| if let Response::Name(n) = r { Some(n) } else { None })
    }

    fn get_pid_by_name(&mut self, name: &str) -> Result<u32, ProcessManagerError> {
        let resp = call(self.transport, &Request::GetPidByName { name: String::from(name) })?;
        expect(resp, |r| if let Response::Pid(pid) = r { Some(pid) } else { None })
    }

    fn suspend(&mut self, pid: u32) -> Result<(), ProcessManagerError> {
        let resp = call(self.transport, &Request::Suspend { pid })?;
        expect(resp, |r| if let Response::Ack = r { Some(()) } else { None })
    }

    fn resume(&mut self, pid: u32) -> Result<(), ProcessManagerError> {
        let resp = call(self.transport, &Request::Resume { pid })?;
        expect(resp, |r| if let Response::Ack = r { Some(()) } else { None })
    }

    fn exit(&mut self, status: i32) -> Result<(), ProcessManagerError> {
        let resp = call(self.transport, &Request::Exit { status })?;
        expect(resp, |r| if let Response::Ack = r { Some(()) } else { None })
    }

    fn wait(&mut self, pid: u32) -> Result<i32, ProcessManagerError> {
        let resp = call(self.transport, &Request::Wait { pid })?;
        expect(resp, |r| if let Response::ExitCode(code) = r { Some(code) } else { None })
    }

    fn kill(&mut self, pid: u32) -> Result<(), ProcessManagerError> {
        let resp = call(self.transport, &Request::Kill { pid })?;
        expect(resp, |r| if let Response::Ack = r { Some(()) } else { None })
    }

    fn kill_all(&mut self, name: &str) -> Result<(), ProcessManagerError> {
        let resp = call(self.transport, &Request::KillAll { name: String::from(name) })?;
        expect(resp, |r| if let Response::Ack = r { Some(()) } else { None })
    }

    fn capscan(&mut self, pid: u32) -> Result<(), ProcessManagerError> {
        let resp = call(self.transport, &Request::CapScan { pid })?;
        expect(resp, |r| if let Response::Ack = r { Some(()) } else { None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// An in-memory loopback transport standing in for the "server"
    /// side of the channel: queues up a scripted reply for whatever
    /// request comes in next.
    struct FakeServer {
        replies: VecDeque<Vec<u8>>,
        sent: Vec<Vec<u8>>,
    }
    impl FrameTransport for FakeServer {
        fn max_frame(&self) -> usize { 4096 }
        fn send_frame(&mut self, data: &[u8], _cap: Option<Capref>, _more: bool) -> Result<(), RpcError> {
            self.sent.push(data.to_vec());
            Ok(())
        }
        fn recv_frame(&mut self, buf: &mut [u8]) -> Result<(usize, Option<Capref>, bool), RpcError> {
            let reply = self.replies.pop_front().ok_or(RpcError::NotReady)?;
            buf[..reply.len()].copy_from_slice(&reply);
            Ok((reply.len(), None, false))
        }
    }

    fn server_with_reply(resp: &Response) -> FakeServer {
        let mut replies = VecDeque::new();
        replies.push_back(postcard::to_allocvec(resp).unwrap());
        FakeServer { replies, sent: Vec::new() }
    }

    #[test]
    fn spawn_with_cmdline_round_trips_pid() {
        let mut server = server_with_reply(&Response::Pid(42));
        let mut client = ProcClient::new(&mut server);
        let pid = client.spawn_with_cmdline("hello arg1").unwrap();
        assert_eq!(pid, 42);
    }

    #[test]
    fn server_error_propagates_to_caller() {
        let mut server = server_with_reply(&Response::Err(ProcessManagerError::ProcessNotFound));
        let mut client = ProcClient::new(&mut server);
        assert_eq!(client.get_status(7), Err(ProcessManagerError::ProcessNotFound));
    }

    #[test]
    fn get_pid_by_name_and_kill_all_round_trip() {
        let mut server = server_with_reply(&Response::Pid(9));
        let mut client = ProcClient::new(&mut server);
        assert_eq!(client.get_pid_by_name("hello").unwrap(), 9);

        let mut server = server_with_reply(&Response::Ack);
        let mut client = ProcClient::new(&mut server);
        assert!(client.kill_all("hello").is_ok());
    }

    #[test]
    fn wait_returns_exit_code() {
        let mut server = server_with_reply(&Response::ExitCode(0));
        let mut client = ProcClient::new(&mut server);
        assert_eq!(client.wait(1).unwrap(), 0);
    }
}
