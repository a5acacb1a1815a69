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

use crate::api::ChannelError;
use crate::api::NotificationEvent;
use crate::api::SctpMessage;
use crate::executor::OpFuture;
use crate::executor::OpPromise;
use log::warn;
use std::fs::File;
use std::net::SocketAddr;
use std::sync::Arc;

/// Inbound events the channel feeds into the application.
///
/// All callbacks run on the channel's owner event loop.
pub trait InboundEvents: Send {
    /// The channel became connected.
    fn channel_active(&mut self) {}

    /// The channel reached its terminal state. No further events follow.
    fn channel_inactive(&mut self) {}

    /// One received datagram.
    fn message_received(&mut self, message: SctpMessage) {
        let _ = message;
    }

    /// One out-of-band notification.
    fn user_event_triggered(&mut self, event: NotificationEvent) {
        let _ = event;
    }
}

/// A region of a file submitted for zero-copy transfer.
pub struct FileRegion {
    pub file: File,
    pub position: u64,
    pub count: u64,
}

/// The operations a pipeline tail must be able to execute.
pub trait OutboundInvoker: Send + Sync {
    fn bind(&self, local: SocketAddr, promise: OpPromise);
    fn connect(&self, remote: SocketAddr, local: Option<SocketAddr>, promise: OpPromise);
    fn disconnect(&self, promise: OpPromise);
    fn close(&self, promise: OpPromise);
    fn deregister(&self, promise: OpPromise);
    fn flush(&self, promise: OpPromise);
    fn send_file(&self, region: FileRegion, promise: OpPromise);
}

/// Base handler for outbound operations.
///
/// Every operation has a provided default that forwards to the next handler in the
/// pipeline, so implementations only override what they intercept.
///
/// Handlers that advertise the outbound capability must override
/// [`OperationHandler::flush`]; the unoverridden default would silently drop buffered
/// writes, so it fails the operation with [`ChannelError::MissingFlushOverride`]
/// instead of forwarding.
pub trait OperationHandler: Send {
    /// True when this handler takes part in outbound message flushing.
    fn advertises_outbound(&self) -> bool {
        false
    }

    fn bind(&mut self, ctx: &mut OutboundContext<'_>, local: SocketAddr, promise: OpPromise) {
        ctx.bind(local, promise);
    }

    fn connect(
        &mut self,
        ctx: &mut OutboundContext<'_>,
        remote: SocketAddr,
        local: Option<SocketAddr>,
        promise: OpPromise,
    ) {
        ctx.connect(remote, local, promise);
    }

    fn disconnect(&mut self, ctx: &mut OutboundContext<'_>, promise: OpPromise) {
        ctx.disconnect(promise);
    }

    fn close(&mut self, ctx: &mut OutboundContext<'_>, promise: OpPromise) {
        ctx.close(promise);
    }

    fn deregister(&mut self, ctx: &mut OutboundContext<'_>, promise: OpPromise) {
        ctx.deregister(promise);
    }

    fn flush(&mut self, ctx: &mut OutboundContext<'_>, promise: OpPromise) {
        if self.advertises_outbound() {
            warn!("flush reached the default implementation of an outbound handler");
            promise.fail(ChannelError::MissingFlushOverride);
            return;
        }
        ctx.flush(promise);
    }

    fn send_file(&mut self, ctx: &mut OutboundContext<'_>, region: FileRegion, promise: OpPromise) {
        ctx.send_file(region, promise);
    }
}

/// Forwards an outbound operation to the remaining handlers, ending at the tail.
pub struct OutboundContext<'a> {
    next: &'a mut [Box<dyn OperationHandler>],
    tail: &'a Arc<dyn OutboundInvoker>,
}

macro_rules! forward_op {
    ($self:ident, $op:ident $(, $arg:expr)*) => {{
        let next = std::mem::take(&mut $self.next);
        match next.split_first_mut() {
            Some((handler, rest)) => {
                let mut ctx = OutboundContext { next: rest, tail: $self.tail };
                handler.$op(&mut ctx $(, $arg)*);
            }
            None => $self.tail.$op($($arg),*),
        }
    }};
}

impl OutboundContext<'_> {
    pub fn bind(&mut self, local: SocketAddr, promise: OpPromise) {
        forward_op!(self, bind, local, promise);
    }

    pub fn connect(&mut self, remote: SocketAddr, local: Option<SocketAddr>, promise: OpPromise) {
        forward_op!(self, connect, remote, local, promise);
    }

    pub fn disconnect(&mut self, promise: OpPromise) {
        forward_op!(self, disconnect, promise);
    }

    pub fn close(&mut self, promise: OpPromise) {
        forward_op!(self, close, promise);
    }

    pub fn deregister(&mut self, promise: OpPromise) {
        forward_op!(self, deregister, promise);
    }

    pub fn flush(&mut self, promise: OpPromise) {
        forward_op!(self, flush, promise);
    }

    pub fn send_file(&mut self, region: FileRegion, promise: OpPromise) {
        forward_op!(self, send_file, region, promise);
    }
}

/// The outbound half of a channel pipeline.
///
/// Operations enter at the first handler and travel towards the tail, which executes
/// them on the channel.
pub struct OutboundPipeline {
    handlers: Vec<Box<dyn OperationHandler>>,
    tail: Arc<dyn OutboundInvoker>,
}

impl OutboundPipeline {
    pub fn new(tail: Arc<dyn OutboundInvoker>) -> OutboundPipeline {
        OutboundPipeline { handlers: Vec::new(), tail }
    }

    /// Appends a handler at the end of the chain, closest to the tail.
    pub fn add_last(&mut self, handler: Box<dyn OperationHandler>) {
        self.handlers.push(handler);
    }

    fn context(&mut self) -> OutboundContext<'_> {
        OutboundContext { next: &mut self.handlers[..], tail: &self.tail }
    }

    pub fn bind(&mut self, local: SocketAddr) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        self.context().bind(local, promise);
        future
    }

    pub fn connect(&mut self, remote: SocketAddr, local: Option<SocketAddr>) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        self.context().connect(remote, local, promise);
        future
    }

    pub fn disconnect(&mut self) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        self.context().disconnect(promise);
        future
    }

    pub fn close(&mut self) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        self.context().close(promise);
        future
    }

    pub fn deregister(&mut self) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        self.context().deregister(promise);
        future
    }

    pub fn flush(&mut self) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        self.context().flush(promise);
        future
    }

    pub fn send_file(&mut self, region: FileRegion) -> OpFuture {
        let (promise, future) = OpPromise::pair();
        self.context().send_file(region, promise);
        future
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records which operations reached the tail.
    struct RecordingTail {
        ops: Mutex<Vec<String>>,
    }

    impl RecordingTail {
        fn new() -> Arc<RecordingTail> {
            Arc::new(RecordingTail { ops: Mutex::new(Vec::new()) })
        }

        fn record(&self, op: &str) {
            self.ops.lock().unwrap().push(op.to_string());
        }

        fn ops(&self) -> Vec<String> {
            self.ops.lock().unwrap().clone()
        }
    }

    impl OutboundInvoker for RecordingTail {
        fn bind(&self, local: SocketAddr, promise: OpPromise) {
            self.record(&format!("bind:{}", local));
            promise.succeed();
        }

        fn connect(&self, remote: SocketAddr, _local: Option<SocketAddr>, promise: OpPromise) {
            self.record(&format!("connect:{}", remote));
            promise.succeed();
        }

        fn disconnect(&self, promise: OpPromise) {
            self.record("disconnect");
            promise.succeed();
        }

        fn close(&self, promise: OpPromise) {
            self.record("close");
            promise.succeed();
        }

        fn deregister(&self, promise: OpPromise) {
            self.record("deregister");
            promise.succeed();
        }

        fn flush(&self, promise: OpPromise) {
            self.record("flush");
            promise.succeed();
        }

        fn send_file(&self, _region: FileRegion, promise: OpPromise) {
            self.record("send_file");
            promise.succeed();
        }
    }

    /// A handler that keeps every default implementation.
    struct PassThrough;

    impl OperationHandler for PassThrough {}

    /// An outbound handler that forgot to override flush.
    struct BrokenOutbound;

    impl OperationHandler for BrokenOutbound {
        fn advertises_outbound(&self) -> bool {
            true
        }
    }

    /// An outbound handler with a proper flush override.
    struct CountingOutbound {
        flushes: Arc<Mutex<usize>>,
    }

    impl OperationHandler for CountingOutbound {
        fn advertises_outbound(&self) -> bool {
            true
        }

        fn flush(&mut self, ctx: &mut OutboundContext<'_>, promise: OpPromise) {
            *self.flushes.lock().unwrap() += 1;
            ctx.flush(promise);
        }
    }

    #[test]
    fn defaults_forward_every_operation_to_the_tail() {
        let tail = RecordingTail::new();
        let mut pipeline = OutboundPipeline::new(Arc::clone(&tail) as Arc<dyn OutboundInvoker>);
        pipeline.add_last(Box::new(PassThrough));
        pipeline.add_last(Box::new(PassThrough));

        let local: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:7002".parse().unwrap();
        pipeline.bind(local).wait().unwrap();
        pipeline.connect(remote, None).wait().unwrap();
        pipeline.disconnect().wait().unwrap();
        pipeline.deregister().wait().unwrap();
        pipeline.flush().wait().unwrap();
        pipeline.close().wait().unwrap();

        assert_eq!(
            tail.ops(),
            vec![
                format!("bind:{}", local),
                format!("connect:{}", remote),
                "disconnect".to_string(),
                "deregister".to_string(),
                "flush".to_string(),
                "close".to_string(),
            ]
        );
    }

    #[test]
    fn unoverridden_flush_on_an_outbound_handler_fails() {
        let tail = RecordingTail::new();
        let mut pipeline = OutboundPipeline::new(Arc::clone(&tail) as Arc<dyn OutboundInvoker>);
        pipeline.add_last(Box::new(BrokenOutbound));

        let err = pipeline.flush().wait().unwrap_err();
        assert!(matches!(err, ChannelError::MissingFlushOverride));
        assert!(tail.ops().is_empty());
    }

    #[test]
    fn overridden_flush_on_an_outbound_handler_forwards() {
        let tail = RecordingTail::new();
        let flushes = Arc::new(Mutex::new(0));
        let mut pipeline = OutboundPipeline::new(Arc::clone(&tail) as Arc<dyn OutboundInvoker>);
        pipeline.add_last(Box::new(CountingOutbound { flushes: Arc::clone(&flushes) }));

        pipeline.flush().wait().unwrap();
        assert_eq!(*flushes.lock().unwrap(), 1);
        assert_eq!(tail.ops(), vec!["flush".to_string()]);
    }

    #[test]
    fn non_outbound_handlers_forward_flush_by_default() {
        let tail = RecordingTail::new();
        let mut pipeline = OutboundPipeline::new(Arc::clone(&tail) as Arc<dyn OutboundInvoker>);
        pipeline.add_last(Box::new(PassThrough));

        pipeline.flush().wait().unwrap();
        assert_eq!(tail.ops(), vec!["flush".to_string()]);
    }
}
