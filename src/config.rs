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
use crate::api::InitMaxStreams;
use crate::api::OptionValue;
use crate::api::SocketOption;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

/// A kernel object options can be applied to and read back from.
pub trait OptionTarget: Send + Sync {
    fn apply(&self, option: SocketOption, value: &OptionValue) -> io::Result<()>;
    fn read(&self, option: SocketOption) -> io::Result<OptionValue>;
}

/// Option keys applied to the kernel socket, as opposed to keys the channel consumes
/// locally.
const KERNEL_OPTIONS: [SocketOption; 7] = [
    SocketOption::SoRcvbuf,
    SocketOption::SoSndbuf,
    SocketOption::SoReuseaddr,
    SocketOption::SoLinger,
    SocketOption::SctpNodelay,
    SocketOption::SctpInitMaxstreams,
    SocketOption::SctpPrimaryAddr,
];

const DEFAULT_RCVBUF_SIZE: i32 = 32 * 1024;
const DEFAULT_SNDBUF_SIZE: i32 = 32 * 1024;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SO_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_WRITE_SPIN_COUNT: u32 = 16;

fn default_value(option: SocketOption) -> OptionValue {
    match option {
        SocketOption::SoRcvbuf => OptionValue::Int(DEFAULT_RCVBUF_SIZE),
        SocketOption::SoSndbuf => OptionValue::Int(DEFAULT_SNDBUF_SIZE),
        SocketOption::SoReuseaddr => OptionValue::Bool(false),
        SocketOption::SoLinger => OptionValue::Linger(None),
        SocketOption::SctpNodelay => OptionValue::Bool(true),
        SocketOption::SctpInitMaxstreams => OptionValue::InitMaxStreams(InitMaxStreams::default()),
        SocketOption::SctpPrimaryAddr => {
            OptionValue::Addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
        }
        SocketOption::ConnectTimeout => OptionValue::Duration(DEFAULT_CONNECT_TIMEOUT),
        SocketOption::SoTimeout => OptionValue::Duration(DEFAULT_SO_TIMEOUT),
        SocketOption::WriteSpinCount => OptionValue::Int(DEFAULT_WRITE_SPIN_COUNT as i32),
        SocketOption::SoBacklog => OptionValue::Int(somaxconn()),
    }
}

/// Validates an option value against its key.
fn validate(option: SocketOption, value: &OptionValue) -> Result<(), ChannelError> {
    let ok = match (option, value) {
        (SocketOption::SoRcvbuf, OptionValue::Int(v))
        | (SocketOption::SoSndbuf, OptionValue::Int(v))
        | (SocketOption::WriteSpinCount, OptionValue::Int(v)) => *v > 0,
        (SocketOption::SoBacklog, OptionValue::Int(v)) => *v >= 0,
        (SocketOption::SoReuseaddr, OptionValue::Bool(_))
        | (SocketOption::SctpNodelay, OptionValue::Bool(_))
        | (SocketOption::SoLinger, OptionValue::Linger(_))
        | (SocketOption::SctpInitMaxstreams, OptionValue::InitMaxStreams(_))
        | (SocketOption::SctpPrimaryAddr, OptionValue::Addr(_))
        | (SocketOption::ConnectTimeout, OptionValue::Duration(_))
        | (SocketOption::SoTimeout, OptionValue::Duration(_)) => true,
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ChannelError::InvalidOption(option, format!("{:?}", value)))
    }
}

/// Reads the system accept backlog limit.
fn somaxconn() -> i32 {
    std::fs::read_to_string("/proc/sys/net/core/somaxconn")
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(libc::SOMAXCONN)
}

enum OptState {
    /// No socket yet; writes are cached.
    Pending(HashMap<SocketOption, OptionValue>),
    /// Socket assigned; reads and writes go through to the kernel.
    Applied(Arc<dyn OptionTarget>),
}

/// Kernel-backed options with deferred application.
///
/// Options set before a socket is assigned are cached. The first
/// [`DeferredOptions::assign`] publishes the socket, drains the cache into kernel
/// option calls and drops it; later assigns are no-ops and all subsequent writes go
/// straight through.
struct DeferredOptions {
    state: Mutex<OptState>,
}

impl DeferredOptions {
    fn new() -> DeferredOptions {
        DeferredOptions { state: Mutex::new(OptState::Pending(HashMap::new())) }
    }

    fn get(&self, option: SocketOption) -> Result<OptionValue, ChannelError> {
        match &*self.state.lock().unwrap() {
            OptState::Pending(map) => {
                Ok(map.get(&option).cloned().unwrap_or_else(|| default_value(option)))
            }
            OptState::Applied(target) => target.read(option).map_err(ChannelError::ConfigIo),
        }
    }

    fn set(&self, option: SocketOption, value: OptionValue) -> Result<(), ChannelError> {
        validate(option, &value)?;
        match &mut *self.state.lock().unwrap() {
            OptState::Pending(map) => {
                map.insert(option, value);
                Ok(())
            }
            OptState::Applied(target) => {
                target.apply(option, &value).map_err(ChannelError::ConfigIo)
            }
        }
    }

    fn assign(&self, target: Arc<dyn OptionTarget>) -> Result<(), ChannelError> {
        let mut state = self.state.lock().unwrap();
        let OptState::Pending(map) = &mut *state else {
            // Only the first caller drains.
            return Ok(());
        };
        let pending = std::mem::take(map);
        *state = OptState::Applied(Arc::clone(&target));
        drop(state);
        for (option, value) in pending {
            target.apply(option, &value).map_err(ChannelError::ConfigIo)?;
        }
        Ok(())
    }

    fn is_assigned(&self) -> bool {
        matches!(&*self.state.lock().unwrap(), OptState::Applied(_))
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        match &*self.state.lock().unwrap() {
            OptState::Pending(map) => map.len(),
            OptState::Applied(_) => 0,
        }
    }
}

/// Configuration of an SCTP channel.
///
/// Kernel-backed keys use deferred application; the channel-local keys
/// (`CONNECT_TIMEOUT`, `SO_TIMEOUT`, `WRITE_SPIN_COUNT`) are plain fields.
pub struct SctpChannelConfig {
    kernel: DeferredOptions,
    connect_timeout_ms: AtomicU64,
    so_timeout_ms: AtomicU64,
    write_spin_count: AtomicU32,
}

impl SctpChannelConfig {
    /// Creates a configuration with no socket assigned. Kernel-backed writes are
    /// cached until assignment.
    pub fn new() -> SctpChannelConfig {
        SctpChannelConfig {
            kernel: DeferredOptions::new(),
            connect_timeout_ms: AtomicU64::new(DEFAULT_CONNECT_TIMEOUT.as_millis() as u64),
            so_timeout_ms: AtomicU64::new(DEFAULT_SO_TIMEOUT.as_millis() as u64),
            write_spin_count: AtomicU32::new(DEFAULT_WRITE_SPIN_COUNT),
        }
    }

    /// Publishes the socket and flushes the cached options into it. Only the first
    /// assignment drains; later calls are no-ops.
    pub fn assign(&self, target: Arc<dyn OptionTarget>) -> Result<(), ChannelError> {
        self.kernel.assign(target)
    }

    /// True once a socket has been assigned.
    pub fn is_assigned(&self) -> bool {
        self.kernel.is_assigned()
    }

    /// Returns the value of `option`.
    pub fn get_option(&self, option: SocketOption) -> Result<OptionValue, ChannelError> {
        match option {
            SocketOption::ConnectTimeout => Ok(OptionValue::Duration(self.connect_timeout())),
            SocketOption::SoTimeout => Ok(OptionValue::Duration(self.so_timeout())),
            SocketOption::WriteSpinCount => Ok(OptionValue::Int(self.write_spin_count() as i32)),
            _ if KERNEL_OPTIONS.contains(&option) => self.kernel.get(option),
            _ => Err(ChannelError::UnknownOption(option)),
        }
    }

    /// Sets `option` to `value`, caching it when no socket is assigned yet.
    pub fn set_option(&self, option: SocketOption, value: OptionValue) -> Result<(), ChannelError> {
        validate(option, &value)?;
        match (option, &value) {
            (SocketOption::ConnectTimeout, OptionValue::Duration(d)) => {
                self.connect_timeout_ms.store(d.as_millis() as u64, Ordering::Release);
                Ok(())
            }
            (SocketOption::SoTimeout, OptionValue::Duration(d)) => {
                self.so_timeout_ms.store(d.as_millis() as u64, Ordering::Release);
                Ok(())
            }
            (SocketOption::WriteSpinCount, OptionValue::Int(v)) => {
                self.write_spin_count.store(*v as u32, Ordering::Release);
                Ok(())
            }
            _ if KERNEL_OPTIONS.contains(&option) => self.kernel.set(option, value),
            _ => Err(ChannelError::UnknownOption(option)),
        }
    }

    /// Returns all recognized option keys and their current values.
    pub fn get_options(&self) -> Result<HashMap<SocketOption, OptionValue>, ChannelError> {
        let mut all = HashMap::new();
        for option in KERNEL_OPTIONS {
            all.insert(option, self.get_option(option)?);
        }
        for option in [SocketOption::ConnectTimeout, SocketOption::SoTimeout, SocketOption::WriteSpinCount] {
            all.insert(option, self.get_option(option)?);
        }
        Ok(all)
    }

    pub fn receive_buffer_size(&self) -> Result<i32, ChannelError> {
        match self.kernel.get(SocketOption::SoRcvbuf)? {
            OptionValue::Int(v) => Ok(v),
            value => Err(ChannelError::InvalidOption(SocketOption::SoRcvbuf, format!("{:?}", value))),
        }
    }

    pub fn set_receive_buffer_size(&self, size: i32) -> Result<(), ChannelError> {
        self.kernel.set(SocketOption::SoRcvbuf, OptionValue::Int(size))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_connect_timeout(&self, timeout: Duration) {
        self.connect_timeout_ms.store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn so_timeout(&self) -> Duration {
        Duration::from_millis(self.so_timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_so_timeout(&self, timeout: Duration) {
        self.so_timeout_ms.store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn write_spin_count(&self) -> u32 {
        self.write_spin_count.load(Ordering::Acquire)
    }
}

impl Default for SctpChannelConfig {
    fn default() -> Self {
        SctpChannelConfig::new()
    }
}

/// Configuration of a server-side SCTP channel created before its socket exists.
///
/// Recognizes the accept backlog in addition to the socket-level keys and shares the
/// deferred application mechanism of [`SctpChannelConfig`].
pub struct SctpServerChannelConfig {
    kernel: DeferredOptions,
    backlog: AtomicI32,
}

impl SctpServerChannelConfig {
    pub fn new() -> SctpServerChannelConfig {
        SctpServerChannelConfig {
            kernel: DeferredOptions::new(),
            backlog: AtomicI32::new(somaxconn()),
        }
    }

    /// Publishes the socket and flushes the cached options into it. Only the first
    /// assignment drains; later calls are no-ops.
    pub fn assign(&self, target: Arc<dyn OptionTarget>) -> Result<(), ChannelError> {
        self.kernel.assign(target)
    }

    pub fn get_option(&self, option: SocketOption) -> Result<OptionValue, ChannelError> {
        match option {
            SocketOption::SoRcvbuf | SocketOption::SoReuseaddr => self.kernel.get(option),
            SocketOption::SoBacklog => Ok(OptionValue::Int(self.backlog())),
            _ => Err(ChannelError::UnknownOption(option)),
        }
    }

    pub fn set_option(&self, option: SocketOption, value: OptionValue) -> Result<(), ChannelError> {
        validate(option, &value)?;
        match (option, &value) {
            (SocketOption::SoRcvbuf, _) | (SocketOption::SoReuseaddr, _) => {
                self.kernel.set(option, value)
            }
            (SocketOption::SoBacklog, OptionValue::Int(v)) => {
                self.backlog.store(*v, Ordering::Release);
                Ok(())
            }
            _ => Err(ChannelError::UnknownOption(option)),
        }
    }

    pub fn get_options(&self) -> Result<HashMap<SocketOption, OptionValue>, ChannelError> {
        let mut all = HashMap::new();
        for option in [SocketOption::SoRcvbuf, SocketOption::SoReuseaddr, SocketOption::SoBacklog] {
            all.insert(option, self.get_option(option)?);
        }
        Ok(all)
    }

    pub fn backlog(&self) -> i32 {
        self.backlog.load(Ordering::Acquire)
    }

    pub fn set_backlog(&self, backlog: i32) -> Result<(), ChannelError> {
        validate(SocketOption::SoBacklog, &OptionValue::Int(backlog))?;
        self.backlog.store(backlog, Ordering::Release);
        Ok(())
    }

    /// Latency and bandwidth preferences have no meaning for SCTP sockets.
    pub fn set_performance_preferences(
        &self,
        _connection_time: i32,
        _latency: i32,
        _bandwidth: i32,
    ) -> Result<(), ChannelError> {
        Err(ChannelError::UnsupportedOperation("set_performance_preferences"))
    }
}

impl Default for SctpServerChannelConfig {
    fn default() -> Self {
        SctpServerChannelConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records applied options instead of touching a kernel socket.
    struct MockTarget {
        applied: Mutex<Vec<(SocketOption, OptionValue)>>,
        fail: bool,
    }

    impl MockTarget {
        fn new() -> Arc<MockTarget> {
            Arc::new(MockTarget { applied: Mutex::new(Vec::new()), fail: false })
        }

        fn failing() -> Arc<MockTarget> {
            Arc::new(MockTarget { applied: Mutex::new(Vec::new()), fail: true })
        }

        fn value_of(&self, option: SocketOption) -> Option<OptionValue> {
            self.applied
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|(o, _)| *o == option)
                .map(|(_, v)| v.clone())
        }
    }

    impl OptionTarget for MockTarget {
        fn apply(&self, option: SocketOption, value: &OptionValue) -> io::Result<()> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::Other, "mock failure"));
            }
            self.applied.lock().unwrap().push((option, value.clone()));
            Ok(())
        }

        fn read(&self, option: SocketOption) -> io::Result<OptionValue> {
            self.value_of(option)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "option never applied"))
        }
    }

    #[test]
    fn options_set_before_assign_are_flushed_once() {
        let config = SctpChannelConfig::new();
        config.set_option(SocketOption::SoRcvbuf, OptionValue::Int(65536)).unwrap();
        config.set_option(SocketOption::SoReuseaddr, OptionValue::Bool(true)).unwrap();
        assert_eq!(config.kernel.pending_len(), 2);

        let target = MockTarget::new();
        config.assign(Arc::clone(&target) as Arc<dyn OptionTarget>).unwrap();

        assert_eq!(target.value_of(SocketOption::SoRcvbuf), Some(OptionValue::Int(65536)));
        assert_eq!(target.value_of(SocketOption::SoReuseaddr), Some(OptionValue::Bool(true)));
        assert_eq!(config.kernel.pending_len(), 0);
    }

    #[test]
    fn second_assign_is_a_no_op() {
        let config = SctpChannelConfig::new();
        config.set_option(SocketOption::SoRcvbuf, OptionValue::Int(1024)).unwrap();

        let first = MockTarget::new();
        let second = MockTarget::new();
        config.assign(Arc::clone(&first) as Arc<dyn OptionTarget>).unwrap();
        config.assign(Arc::clone(&second) as Arc<dyn OptionTarget>).unwrap();

        assert_eq!(first.value_of(SocketOption::SoRcvbuf), Some(OptionValue::Int(1024)));
        assert!(second.applied.lock().unwrap().is_empty());
    }

    #[test]
    fn writes_after_assign_go_through_to_the_target() {
        let config = SctpChannelConfig::new();
        let target = MockTarget::new();
        config.assign(Arc::clone(&target) as Arc<dyn OptionTarget>).unwrap();

        config.set_option(SocketOption::SctpNodelay, OptionValue::Bool(false)).unwrap();
        assert_eq!(target.value_of(SocketOption::SctpNodelay), Some(OptionValue::Bool(false)));
    }

    #[test]
    fn unassigned_reads_fall_back_to_documented_defaults() {
        let config = SctpChannelConfig::new();
        assert_eq!(config.get_option(SocketOption::SoRcvbuf).unwrap(), OptionValue::Int(32768));
        assert_eq!(config.get_option(SocketOption::SoReuseaddr).unwrap(), OptionValue::Bool(false));
        assert_eq!(config.get_option(SocketOption::SctpNodelay).unwrap(), OptionValue::Bool(true));

        // Every recognized key resolves to a value even before a socket exists.
        let all = config.get_options().unwrap();
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn kernel_failure_during_write_through_is_config_io() {
        let config = SctpChannelConfig::new();
        config.assign(MockTarget::failing() as Arc<dyn OptionTarget>).unwrap();
        let err = config.set_option(SocketOption::SoSndbuf, OptionValue::Int(1)).unwrap_err();
        assert!(matches!(err, ChannelError::ConfigIo(_)));
    }

    #[test]
    fn backlog_is_rejected_on_the_channel_config() {
        let config = SctpChannelConfig::new();
        let err = config.get_option(SocketOption::SoBacklog).unwrap_err();
        assert!(matches!(err, ChannelError::UnknownOption(SocketOption::SoBacklog)));
    }

    #[test]
    fn invalid_values_are_rejected_before_caching() {
        let config = SctpChannelConfig::new();
        assert!(matches!(
            config.set_option(SocketOption::SoRcvbuf, OptionValue::Int(0)),
            Err(ChannelError::InvalidOption(SocketOption::SoRcvbuf, _))
        ));
        assert!(matches!(
            config.set_option(SocketOption::SoRcvbuf, OptionValue::Bool(true)),
            Err(ChannelError::InvalidOption(SocketOption::SoRcvbuf, _))
        ));
        assert_eq!(config.kernel.pending_len(), 0);
    }

    #[test]
    fn negative_backlog_is_invalid() {
        let config = SctpServerChannelConfig::new();
        assert!(matches!(
            config.set_backlog(-1),
            Err(ChannelError::InvalidOption(SocketOption::SoBacklog, _))
        ));
    }

    #[test]
    fn server_config_defaults_backlog_to_somaxconn() {
        let config = SctpServerChannelConfig::new();
        assert_eq!(config.backlog(), somaxconn());
        assert!(config.backlog() >= 0);
    }

    #[test]
    fn server_config_refuses_performance_preferences() {
        let config = SctpServerChannelConfig::new();
        assert!(matches!(
            config.set_performance_preferences(1, 2, 3),
            Err(ChannelError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn server_config_defers_socket_options_like_the_channel_config() {
        let config = SctpServerChannelConfig::new();
        config.set_option(SocketOption::SoReuseaddr, OptionValue::Bool(true)).unwrap();
        config.set_option(SocketOption::SoBacklog, OptionValue::Int(7)).unwrap();

        let target = MockTarget::new();
        config.assign(Arc::clone(&target) as Arc<dyn OptionTarget>).unwrap();

        assert_eq!(target.value_of(SocketOption::SoReuseaddr), Some(OptionValue::Bool(true)));
        assert_eq!(config.backlog(), 7);
        assert!(matches!(
            config.get_option(SocketOption::SctpNodelay),
            Err(ChannelError::UnknownOption(_))
        ));
    }

    #[test]
    fn connect_timeout_and_spin_count_are_local_fields() {
        let config = SctpChannelConfig::new();
        config
            .set_option(SocketOption::ConnectTimeout, OptionValue::Duration(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_millis(100));
        assert_eq!(config.write_spin_count(), 16);
        assert!(matches!(
            config.set_option(SocketOption::WriteSpinCount, OptionValue::Int(0)),
            Err(ChannelError::InvalidOption(_, _))
        ));
    }
}
