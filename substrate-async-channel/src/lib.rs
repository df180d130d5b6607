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

//! A single underlying RPC channel multiplexed into many concurrent
//! logical requests, each with its own response callback.
//!
//! The channel can only have one message in flight at a time, so two
//! FIFO queues -- outgoing requests and outgoing responses to requests
//! *we* received -- take turns: after a request goes out, the next send
//! tries the response queue first (and vice versa), falling back to
//! whichever queue has work when the other is empty. A request's
//! identifier rides on the wire so its matching response can be routed
//! back to the right callback even though many requests may be in
//! flight (well, queued -- only one message is ever on the wire) at once.
//!
//! The original this is grounded on identifies an outstanding request by
//! the host address of its bookkeeping struct. That doesn't survive a
//! trip over the wire as anything meaningful in Rust, so identifiers
//! here are slot/generation pairs: an identifier that outlives a slot's
//! reuse is simply stale and looked up to nothing, rather than
//! (as a raw, reused pointer could) silently matching the wrong request.
#![cfg_attr(not(test), no_std)]

extern crate alloc;
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

/// A generation-tagged handle identifying one outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncRequestId {
    slot: u32,
    generation: u32,
}
impl AsyncRequestId {
    fn to_wire(self) -> u64 { ((self.slot as u64) << 32) | self.generation as u64 }
    fn from_wire(w: u64) -> Self { AsyncRequestId { slot: (w >> 32) as u32, generation: w as u32 } }
}

#[derive(Debug, Serialize, Deserialize)]
enum WireMessage {
    Request { identifier: u64, data: Vec<u8> },
    Response { identifier: u64, data: Vec<u8> },
}

/// The underlying single-message-at-a-time transport this channel
/// multiplexes over (an LMP or UMP endpoint, typically). `begin_send` and
/// `begin_recv` kick off an operation whose completion the transport
/// reports back by calling [`SimpleAsyncChannel::on_send_complete`] /
/// [`SimpleAsyncChannel::on_recv_complete`].
pub trait AsyncTransport {
    fn begin_send(&mut self, bytes: Vec<u8>);
    fn begin_recv(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Queue {
    Request,
    Response,
}

struct Slot {
    generation: u32,
    callback: Option<Box<dyn FnOnce(&[u8])>>,
}

/// Request-identifier slot table with generation tags so a late or
/// duplicated response for a reused slot is detected rather than
/// silently delivered to the wrong callback.
struct Slots {
    slots: Vec<Slot>,
    free: Vec<u32>,
}
impl Slots {
    fn new() -> Self { Slots { slots: Vec::new(), free: Vec::new() } }

    fn insert(&mut self, callback: Box<dyn FnOnce(&[u8])>) -> AsyncRequestId {
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.callback = Some(callback);
            AsyncRequestId { slot: idx, generation: slot.generation }
        } else {
            let idx = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, callback: Some(callback) });
            AsyncRequestId { slot: idx, generation: 0 }
        }
    }

    fn take(&mut self, id: AsyncRequestId) -> Option<Box<dyn FnOnce(&[u8])>> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation {
            return None; // stale identifier: the slot has since been reused.
        }
        let cb = slot.callback.take();
        self.free.push(id.slot);
        cb
    }
}

/// Applications answer an incoming request synchronously: the handler
/// computes the reply bytes before control returns to the channel. The
/// original allows a request's response to be produced later, from a
/// different callback; plumbing that through here would require exposing
/// the waitset/continuation machinery this crate deliberately doesn't
/// depend on, so it's left for a future extension.
pub type RequestHandler<'a> = dyn FnMut(&[u8]) -> Vec<u8> + 'a;

pub struct SimpleAsyncChannel<'a, T: AsyncTransport> {
    transport: T,
    requests: VecDeque<(AsyncRequestId, Vec<u8>)>,
    responses: VecDeque<(u64, Vec<u8>)>,
    current_sending: Queue,
    request_handler: Box<RequestHandler<'a>>,
    pending: Slots,
}

impl<'a, T: AsyncTransport> SimpleAsyncChannel<'a, T> {
    pub fn new(mut transport: T, request_handler: Box<RequestHandler<'a>>) -> Self {
        transport.begin_recv();
        SimpleAsyncChannel {
            transport,
            requests: VecDeque::new(),
            responses: VecDeque::new(),
            current_sending: Queue::Request,
            request_handler,
            pending: Slots::new(),
        }
    }

    /// Queues an outgoing request, invoking `callback` with the matching
    /// response's payload once it arrives. Kicks off a send immediately
    /// if both queues were empty.
    pub fn request(&mut self, data: Vec<u8>, callback: Box<dyn FnOnce(&[u8])>) {
        let was_empty = self.requests.is_empty() && self.responses.is_empty();
        let id = self.pending.insert(callback);
        self.requests.push_back((id, data));
        if was_empty {
            self.prepare_send();
        }
    }

    fn prepare_send(&mut self) {
        for _ in 0..2 {
            match self.current_sending {
                Queue::Request => {
                    if let Some((id, data)) = self.requests.front() {
                        let wire = WireMessage::Request { identifier: id.to_wire(), data: data.clone() };
                        let bytes = postcard::to_allocvec(&wire).expect("encode request");
                        self.transport.begin_send(bytes);
                        return;
                    }
                    self.current_sending = Queue::Response;
                }
                Queue::Response => {
                    if let Some((identifier, data)) = self.responses.front() {
                        let wire = WireMessage::Response { identifier: *identifier, data: data.clone() };
                        let bytes = postcard::to_allocvec(&wire).expect("encode response");
                        self.transport.begin_send(bytes);
                        return;
                    }
                    self.current_sending = Queue::Request;
                }
            }
        }
        // Both queues empty; nothing to send until the next `request`/`respond_to`.
    }

    /// Must be called by the transport once the send started by the most
    /// recent `begin_send` has completed.
    pub fn on_send_complete(&mut self) {
        match self.current_sending {
            Queue::Request => {
                self.requests.pop_front();
                self.current_sending = Queue::Response;
            }
            Queue::Response => {
                self.responses.pop_front();
                self.current_sending = Queue::Request;
            }
        }
        self.prepare_send();
    }

    /// Must be called by the transport with the payload of the most
    /// recent `begin_recv`, once it has completed.
    pub fn on_recv_complete(&mut self, bytes: &[u8]) {
        if let Ok(msg) = postcard::from_bytes::<WireMessage>(bytes) {
            match msg {
                WireMessage::Response { identifier, data } => {
                    let id = AsyncRequestId::from_wire(identifier);
                    if let Some(cb) = self.pending.take(id) {
                        cb(&data);
                    }
                }
                WireMessage::Request { identifier, data } => {
                    let reply = (self.request_handler)(&data);
                    let was_empty = self.requests.is_empty() && self.responses.is_empty();
                    self.responses.push_back((identifier, reply));
                    if was_empty {
                        self.prepare_send();
                    }
                }
            }
        }
        self.transport.begin_recv();
    }
}
