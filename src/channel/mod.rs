// Copyright 2025 The sctp-channel Authors
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

use crate::api::Association;
use crate::api::ChannelError;
use crate::api::ChannelState;
use crate::api::MessageInfo;
use crate::api::NotificationEvent;
use crate::api::SctpMessage;
use crate::config::OptionTarget;
use crate::config::SctpChannelConfig;
use crate::executor::EventLoop;
use crate::executor::OpFuture;
use crate::executor::OpPromise;
use crate::notification::SctpNotificationHandler;
use crate::pipeline::FileRegion;
use crate::pipeline::InboundEvents;
use crate::pipeline::OutboundInvoker;
use crate::select::Interest;
use crate::select::Selector;
use crate::sys::SctpEndpoint;
#[cfg(not(test))]
use log::warn;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
#[cfg(test)]
use std::println as warn;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;


pub(crate) struct Core {
    ep: Arc<SctpEndpoint>,
    config: SctpChannelConfig,
    read_selector: Selector,
    write_selector: Selector,
    connect_selector: Selector,
    owner: EventLoop,
    state: Mutex<ChannelState>,
    read_suspended: AtomicBool,
    outbound: Mutex<VecDeque<SctpMessage>>,
    inbound: Mutex<Option<Box<dyn InboundEvents>>>,
    notification_handler: SctpNotificationHandler,
}

/// A blocking-mode SCTP channel pinned to one event loop.
///
/// The channel adapts a kernel SCTP endpoint into the pipeline world: discrete
/// messages and association notifications flow inbound, operations flow outbound. The
/// endpoint is non-blocking and watched through three independent selectors, one per
/// readiness dimension, each polled with a bounded wait so the owner can interleave
/// other work.
///
/// All socket I/O and state transitions execute on the owner. Operations invoked from
/// any other thread are re-posted to the owner and complete their returned future
/// there, in submission order.
#[derive(Clone)]
pub struct SctpChannel {
    core: Arc<Core>,
}

impl SctpChannel {
    /// Opens a new channel with a default configuration.
    pub fn open(owner: &EventLoop) -> Result<SctpChannel, ChannelError> {
        Self::open_with_config(owner, SctpChannelConfig::new())
    }

    /// Opens a new channel, assigning its endpoint to `config` and flushing any
    /// options cached before the socket existed.
    pub fn open_with_config(
        owner: &EventLoop,
        config: SctpChannelConfig,
    ) -> Result<SctpChannel, ChannelError> {
        let ep = Arc::new(SctpEndpoint::open().map_err(ChannelError::InitFailed)?);
        let channel = Self::init(owner, config, Arc::clone(&ep));
        if channel.is_err() {
            if let Err(e) = ep.close() {
                warn!("Failed to close a sctp endpoint: {}", e);
            }
        }
        channel
    }

    fn init(
        owner: &EventLoop,
        config: SctpChannelConfig,
        ep: Arc<SctpEndpoint>,
    ) -> Result<SctpChannel, ChannelError> {
        ep.set_nonblocking(true).map_err(ChannelError::InitFailed)?;
        let read_selector =
            Selector::open(ep.as_raw_fd(), Interest::Readable).map_err(ChannelError::InitFailed)?;
        let write_selector =
            Selector::open(ep.as_raw_fd(), Interest::Writable).map_err(ChannelError::InitFailed)?;
        let connect_selector = Selector::open(ep.as_raw_fd(), Interest::Connectable)
            .map_err(ChannelError::InitFailed)?;
        config.assign(Arc::clone(&ep) as Arc<dyn OptionTarget>)?;

        let core = Arc::new_cyclic(|weak| Core {
            ep,
            config,
            read_selector,
            write_selector,
            connect_selector,
            owner: owner.clone(),
            state: Mutex::new(ChannelState::Fresh),
            read_suspended: AtomicBool::new(false),
            outbound: Mutex::new(VecDeque::new()),
            inbound: Mutex::new(None),
            notification_handler: SctpNotificationHandler::new(weak.clone()),
        });
        Ok(SctpChannel { core })
    }

    pub(crate) fn from_core(core: Arc<Core>) -> SctpChannel {
        SctpChannel { core }
    }

    /// Installs the inbound event sink this channel feeds.
    pub fn set_inbound_handler(&self, handler: Box<dyn InboundEvents>) {
        *self.core.inbound.lock().unwrap() = Some(handler);
    }

    pub fn config(&self) -> &SctpChannelConfig {
        &self.core.config
    }

    pub fn state(&self) -> ChannelState {
        *self.core.state.lock().unwrap()
    }

    pub fn is_open(&self) -> bool {
        self.core.ep.is_open()
    }

    /// Returns the live association, or `None` when there is none or it cannot be
    /// determined.
    pub fn association(&self) -> Option<Association> {
        if !self.is_open() {
            return None;
        }
        self.core.ep.association().ok().flatten()
    }

    pub fn is_active(&self) -> bool {
        self.is_open() && self.association().is_some()
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        if !self.is_open() {
            return None;
        }
        self.core.ep.local_addrs().ok().and_then(|addrs| addrs.into_iter().next())
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        if !self.is_open() {
            return None;
        }
        self.core.ep.remote_addrs().ok().and_then(|addrs| addrs.into_iter().next())
    }

    /// Every local address of the endpoint. I/O failures yield the empty set, so this
    /// is safe on partially initialized sockets.
    pub fn all_local_addresses(&self) -> HashSet<SocketAddr> {
        if !self.is_open() {
            return HashSet::new();
        }
        self.core.ep.local_addrs().map(|addrs| addrs.into_iter().collect()).unwrap_or_default()
    }

    /// Every peer address of the association. I/O failures yield the empty set.
    pub fn all_remote_addresses(&self) -> HashSet<SocketAddr> {
        if !self.is_open() {
            return HashSet::new();
        }
        self.core.ep.remote_addrs().map(|addrs| addrs.into_iter().collect()).unwrap_or_default()
    }

    /// Stops delivering messages to the pipeline. Reads already in flight stop at the
    /// next message boundary.
    pub fn suspend_read(&self) {
        self.core.read_suspended.store(true, Ordering::Release);
    }

    /// Resumes message delivery.
    pub fn resume_read(&self) {
        self.core.read_suspended.store(false, Ordering::Release);
        if self.state() == ChannelState::Connected {
            self.schedule_read();
        }
    }

    /// Binds the primary local address.
    pub fn bind(&self, local: SocketAddr) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        self.bind_with_promise(local, promise);
        future
    }

    pub(crate) fn bind_with_promise(&self, local: SocketAddr, promise: OpPromise) {
        let channel = self.clone();
        self.core.owner.run(move || promise.complete(channel.do_bind(local)));
    }

    /// Adds a secondary local address to the association's set.
    pub fn bind_address(&self, address: IpAddr) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        let channel = self.clone();
        self.core.owner.run(move || promise.complete(channel.do_bind_address(address)));
        future
    }

    /// Removes a secondary local address.
    pub fn unbind_address(&self, address: IpAddr) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        let channel = self.clone();
        self.core.owner.run(move || promise.complete(channel.do_unbind_address(address)));
        future
    }

    /// Connects to `remote`, binding `local` first when given.
    pub fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        self.connect_with_promise(remote, local, promise);
        future
    }

    pub(crate) fn connect_with_promise(
        &self,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: OpPromise,
    ) {
        let channel = self.clone();
        self.core.owner.run(move || promise.complete(channel.do_connect(remote, local)));
    }

    /// Enqueues a message for transmission. Delivery starts on the next flush.
    pub fn write(&self, message: SctpMessage) {
        self.core.outbound.lock().unwrap().push_back(message);
    }

    /// Drains the outbound queue to the kernel.
    pub fn flush(&self) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        self.flush_with_promise(promise);
        future
    }

    pub(crate) fn flush_with_promise(&self, promise: OpPromise) {
        let channel = self.clone();
        self.core.owner.run(move || promise.complete(channel.do_write_messages()));
    }

    /// Disconnects the association. SCTP has no half-close distinct from close, so
    /// this is equivalent to [`SctpChannel::close`].
    pub fn disconnect(&self) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        self.disconnect_with_promise(promise);
        future
    }

    pub(crate) fn disconnect_with_promise(&self, promise: OpPromise) {
        let channel = self.clone();
        self.core.owner.run(move || promise.complete(channel.do_disconnect()));
    }

    /// Closes the channel. Idempotent; the first close releases the selectors and the
    /// endpoint.
    pub fn close(&self) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        self.close_with_promise(promise);
        future
    }

    pub(crate) fn close_with_promise(&self, promise: OpPromise) {
        let channel = self.clone();
        self.core.owner.run(move || promise.complete(channel.do_close()));
    }

    pub(crate) fn deregister_with_promise(&self, promise: OpPromise) {
        let channel = self.clone();
        self.core.owner.run(move || promise.complete(channel.ensure_not_closed()));
    }

    fn ensure_not_closed(&self) -> Result<(), ChannelError> {
        if self.state() == ChannelState::Closed {
            Err(ChannelError::ClosedChannel)
        } else {
            Ok(())
        }
    }

    fn do_bind(&self, local: SocketAddr) -> Result<(), ChannelError> {
        self.ensure_not_closed()?;
        self.core.ep.bind(local).map_err(ChannelError::BindFailed)?;
        let mut state = self.core.state.lock().unwrap();
        if *state == ChannelState::Fresh {
            *state = ChannelState::Bound;
        }
        Ok(())
    }

    fn do_bind_address(&self, address: IpAddr) -> Result<(), ChannelError> {
        self.ensure_bound_for_multihoming()?;
        self.core.ep.bind_address(address).map_err(ChannelError::BindFailed)
    }

    fn do_unbind_address(&self, address: IpAddr) -> Result<(), ChannelError> {
        self.ensure_bound_for_multihoming()?;
        self.core.ep.unbind_address(address).map_err(ChannelError::BindFailed)
    }

    fn ensure_bound_for_multihoming(&self) -> Result<(), ChannelError> {
        self.ensure_not_closed()?;
        if self.state() == ChannelState::Fresh {
            return Err(ChannelError::BindFailed(io::Error::new(
                io::ErrorKind::InvalidInput,
                "channel is not bound",
            )));
        }
        Ok(())
    }

    fn do_connect(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Result<(), ChannelError> {
        self.ensure_not_closed()?;
        match self.connect_inner(remote, local) {
            Ok(()) => {
                *self.core.state.lock().unwrap() = ChannelState::Connected;
                self.fire_channel_active();
                self.schedule_read();
                Ok(())
            }
            Err(e) => {
                if let Err(close_err) = self.do_close() {
                    warn!("Failed to close the channel after a connect failure: {}", close_err);
                }
                Err(e)
            }
        }
    }

    fn connect_inner(&self, remote: SocketAddr, local: Option<SocketAddr>) -> Result<(), ChannelError> {
        if let Some(local) = local {
            self.core.ep.bind(local).map_err(ChannelError::BindFailed)?;
        }
        self.core.ep.connect(remote).map_err(ChannelError::ConnectFailed)?;

        let timeout = self.core.config.connect_timeout();
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            if !self.core.connect_selector.is_open() {
                return Err(ChannelError::ConnectFailed(io::Error::new(
                    io::ErrorKind::NotConnected,
                    "connect selector is closed",
                )));
            }
            let mut wait = self.core.config.so_timeout();
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(ChannelError::Timeout);
                }
                wait = wait.min(remaining);
            }
            let selected =
                self.core.connect_selector.select(wait).map_err(ChannelError::ConnectFailed)?;
            if selected > 0 {
                break;
            }
        }
        self.core.ep.finish_connect().map_err(ChannelError::ConnectFailed)
    }

    /// Reads at most one selector turn worth of messages into `out`.
    ///
    /// Yields nothing while reads are suspended or once the read selector is closed.
    /// Notifications interleaved ahead of data are dispatched to the notification
    /// handler from inside the kernel receive.
    fn do_read_messages(&self, out: &mut Vec<SctpMessage>) -> Result<usize, ChannelError> {
        if self.core.read_suspended.load(Ordering::Acquire) || !self.core.read_selector.is_open() {
            return Ok(0);
        }

        let selected = self
            .core
            .read_selector
            .select(self.core.config.so_timeout())
            .map_err(ChannelError::ReadFailed)?;
        if selected == 0 || self.core.read_suspended.load(Ordering::Acquire) {
            return Ok(0);
        }

        let mut read = 0;
        for _ in 0..selected {
            let size = self.core.config.receive_buffer_size()? as usize;
            let mut data = vec![0u8; size];
            let info = self
                .core
                .ep
                .receive(&mut data, None, &self.core.notification_handler)
                .map_err(ChannelError::ReadFailed)?;
            let Some(info) = info else {
                return Ok(read);
            };

            data.truncate(info.len);
            let message = if info.unordered {
                SctpMessage::new_unordered(info.stream_id, info.ppid, data)
            } else {
                SctpMessage::new(info.stream_id, info.ppid, data)
            };
            out.push(message);
            read += 1;

            if self.core.read_suspended.load(Ordering::Acquire) {
                return Ok(read);
            }
        }
        Ok(read)
    }

    /// Writes queued messages, one per selected key per turn.
    fn do_write_messages(&self) -> Result<(), ChannelError> {
        let mut spins_left = self.core.config.write_spin_count();
        loop {
            self.ensure_not_closed()?;
            if self.core.outbound.lock().unwrap().is_empty() {
                return Ok(());
            }
            if !self.core.write_selector.is_open() {
                return Err(ChannelError::ClosedChannel);
            }

            let selected = self
                .core
                .write_selector
                .select(self.core.config.so_timeout())
                .map_err(ChannelError::WriteFailed)?;
            if selected == 0 {
                spins_left -= 1;
                if spins_left == 0 {
                    return Err(ChannelError::WriteFailed(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "write readiness did not arrive",
                    )));
                }
                continue;
            }

            for _ in 0..selected {
                let Some(message) = self.core.outbound.lock().unwrap().pop_front() else {
                    return Ok(());
                };

                let mut info = MessageInfo::outgoing(self.association(), message.stream_id());
                info.ppid = message.ppid();
                info.unordered = message.is_unordered();

                let len = message.payload().len();
                match self.core.ep.send(message.payload(), &info) {
                    Ok(n) if n == len => {}
                    // Messages round-trip whole or not at all; a short count means
                    // the kernel broke the message boundary.
                    Ok(_) => {
                        return Err(ChannelError::WriteFailed(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "short write on a message boundary",
                        )))
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        self.core.outbound.lock().unwrap().push_front(message);
                    }
                    Err(e) => return Err(ChannelError::WriteFailed(e)),
                }
            }
            spins_left = self.core.config.write_spin_count();
        }
    }

    fn do_disconnect(&self) -> Result<(), ChannelError> {
        self.do_close()
    }

    pub(crate) fn do_close(&self) -> Result<(), ChannelError> {
        let was_active;
        {
            let mut state = self.core.state.lock().unwrap();
            if *state == ChannelState::Closed {
                return Ok(());
            }
            was_active = *state == ChannelState::Connected;
            *state = ChannelState::Closed;
        }

        close_selector("read", &self.core.read_selector);
        close_selector("write", &self.core.write_selector);
        close_selector("connect", &self.core.connect_selector);
        let result = self.core.ep.close().map_err(ChannelError::Io);

        self.core.outbound.lock().unwrap().clear();
        if was_active {
            self.fire_channel_inactive();
        }
        result
    }

    /// Closes the channel after a shutdown notification. Runs on the owner, inside
    /// the receive that surfaced the notification.
    pub(crate) fn close_on_shutdown(&self) {
        if let Err(e) = self.do_close() {
            warn!("Failed to close the channel after a shutdown notification: {}", e);
        }
    }

    fn schedule_read(&self) {
        let channel = self.clone();
        self.core.owner.execute(move || channel.read_loop_turn());
    }

    fn read_loop_turn(&self) {
        if self.state() != ChannelState::Connected {
            return;
        }
        if self.core.read_suspended.load(Ordering::Acquire) {
            // Resuming schedules the next turn.
            return;
        }

        let mut batch = Vec::new();
        match self.do_read_messages(&mut batch) {
            Ok(_) => {
                for message in batch {
                    self.fire_message_received(message);
                }
            }
            Err(e) => {
                warn!("Failed to read from the sctp channel: {}", e);
                if let Err(close_err) = self.do_close() {
                    warn!("Failed to close the channel after a read failure: {}", close_err);
                }
                return;
            }
        }

        if self.state() == ChannelState::Connected {
            self.schedule_read();
        }
    }

    /// Runs one inbound callback with the sink taken out of its slot, so a callback
    /// that re-enters the channel cannot deadlock on the slot lock.
    fn with_inbound(&self, f: impl FnOnce(&mut dyn InboundEvents)) {
        let taken = self.core.inbound.lock().unwrap().take();
        if let Some(mut handler) = taken {
            f(handler.as_mut());
            let mut slot = self.core.inbound.lock().unwrap();
            if slot.is_none() {
                *slot = Some(handler);
            }
        }
    }

    fn fire_channel_active(&self) {
        self.with_inbound(|handler| handler.channel_active());
    }

    fn fire_channel_inactive(&self) {
        self.with_inbound(|handler| handler.channel_inactive());
    }

    fn fire_message_received(&self, message: SctpMessage) {
        self.with_inbound(|handler| handler.message_received(message));
    }

    pub(crate) fn fire_user_event(&self, event: NotificationEvent) {
        self.with_inbound(|handler| handler.user_event_triggered(event));
    }

    #[cfg(test)]
    pub(crate) fn selectors_open(&self) -> (bool, bool, bool) {
        (
            self.core.read_selector.is_open(),
            self.core.write_selector.is_open(),
            self.core.connect_selector.is_open(),
        )
    }
}

impl OutboundInvoker for SctpChannel {
    fn bind(&self, local: SocketAddr, promise: OpPromise) {
        self.bind_with_promise(local, promise);
    }

    fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, promise: OpPromise) {
        self.connect_with_promise(remote, local, promise);
    }

    fn disconnect(&self, promise: OpPromise) {
        self.disconnect_with_promise(promise);
    }

    fn close(&self, promise: OpPromise) {
        self.close_with_promise(promise);
    }

    fn deregister(&self, promise: OpPromise) {
        self.deregister_with_promise(promise);
    }

    fn flush(&self, promise: OpPromise) {
        self.flush_with_promise(promise);
    }

    fn send_file(&self, region: FileRegion, promise: OpPromise) {
        drop(region);
        promise.fail(ChannelError::UnsupportedOperation("send_file"));
    }
}

fn close_selector(name: &str, selector: &Selector) {
    if let Err(e) = selector.close() {
        warn!("Failed to close a {} selector: {}", name, e);
    }
}
