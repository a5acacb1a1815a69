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

use crate::api::AssocChangeEvent;
use crate::api::AssociationChange;
use crate::api::Notification;
use crate::api::PeerAddrEvent;
use crate::api::PeerAddressChange;
use crate::api::PpId;
use crate::api::SendFailed;
use crate::api::Shutdown;
use crate::api::StreamId;
use crate::sys::sockaddr_storage_to_addr;
use crate::sys::SndRcvInfo;
use anyhow::bail;
use anyhow::ensure;
use anyhow::Error;
use std::mem;
use std::ptr;

const SCTP_ASSOC_CHANGE: u16 = 0x8001;
const SCTP_PEER_ADDR_CHANGE: u16 = 0x8002;
const SCTP_SEND_FAILED: u16 = 0x8003;
const SCTP_SHUTDOWN_EVENT: u16 = 0x8005;

const SCTP_COMM_UP: u16 = 0;
const SCTP_COMM_LOST: u16 = 1;
const SCTP_RESTART: u16 = 2;
const SCTP_SHUTDOWN_COMP: u16 = 3;
const SCTP_CANT_STR_ASSOC: u16 = 4;

const SCTP_ADDR_AVAILABLE: i32 = 0;
const SCTP_ADDR_UNREACHABLE: i32 = 1;
const SCTP_ADDR_REMOVED: i32 = 2;
const SCTP_ADDR_ADDED: i32 = 3;
const SCTP_ADDR_MADE_PRIM: i32 = 4;
const SCTP_ADDR_CONFIRMED: i32 = 5;

#[allow(dead_code)]
#[derive(Clone, Copy)]
#[repr(C)]
struct AssocChangeRaw {
    sn_type: u16,
    sn_flags: u16,
    sn_length: u32,
    state: u16,
    error: u16,
    outbound_streams: u16,
    inbound_streams: u16,
    assoc_id: i32,
}

// The kernel declares this packed with 4-byte alignment, which keeps the size at 148
// instead of padding to the sockaddr_storage alignment.
#[allow(dead_code)]
#[derive(Clone, Copy)]
#[repr(C, packed(4))]
struct PaddrChangeRaw {
    sn_type: u16,
    sn_flags: u16,
    sn_length: u32,
    aaddr: libc::sockaddr_storage,
    state: i32,
    error: i32,
    assoc_id: i32,
}

#[allow(dead_code)]
#[derive(Clone, Copy)]
#[repr(C)]
struct SendFailedRaw {
    sn_type: u16,
    sn_flags: u16,
    sn_length: u32,
    error: u32,
    info: SndRcvInfo,
    assoc_id: i32,
}

#[allow(dead_code)]
#[derive(Clone, Copy)]
#[repr(C)]
struct ShutdownEventRaw {
    sn_type: u16,
    sn_flags: u16,
    sn_length: u32,
    assoc_id: i32,
}

fn read_raw<T: Copy>(data: &[u8]) -> Result<T, Error> {
    ensure!(
        data.len() >= mem::size_of::<T>(),
        "notification truncated: {} of {} bytes",
        data.len(),
        mem::size_of::<T>()
    );
    Ok(unsafe { ptr::read_unaligned(data.as_ptr() as *const T) })
}

/// Parses one kernel notification.
///
/// Returns `None` for event types the endpoint does not subscribe to.
pub(crate) fn parse_notification(data: &[u8]) -> Result<Option<Notification>, Error> {
    ensure!(data.len() >= 8, "notification header truncated: {} bytes", data.len());
    let sn_type = u16::from_ne_bytes([data[0], data[1]]);

    match sn_type {
        SCTP_ASSOC_CHANGE => {
            let raw: AssocChangeRaw = read_raw(data)?;
            let event = match raw.state {
                SCTP_COMM_UP => AssocChangeEvent::CommUp,
                SCTP_COMM_LOST => AssocChangeEvent::CommLost,
                SCTP_RESTART => AssocChangeEvent::Restart,
                SCTP_SHUTDOWN_COMP => AssocChangeEvent::ShutdownComplete,
                SCTP_CANT_STR_ASSOC => AssocChangeEvent::CantStartAssoc,
                state => bail!("unknown association change state: {}", state),
            };
            Ok(Some(Notification::AssociationChange(AssociationChange {
                event,
                error: raw.error,
                outbound_streams: raw.outbound_streams,
                inbound_streams: raw.inbound_streams,
                assoc_id: raw.assoc_id,
            })))
        }
        SCTP_PEER_ADDR_CHANGE => {
            let raw: PaddrChangeRaw = read_raw(data)?;
            let event = match raw.state {
                SCTP_ADDR_AVAILABLE => PeerAddrEvent::Available,
                SCTP_ADDR_UNREACHABLE => PeerAddrEvent::Unreachable,
                SCTP_ADDR_REMOVED => PeerAddrEvent::Removed,
                SCTP_ADDR_ADDED => PeerAddrEvent::Added,
                SCTP_ADDR_MADE_PRIM => PeerAddrEvent::MadePrimary,
                SCTP_ADDR_CONFIRMED => PeerAddrEvent::Confirmed,
                state => bail!("unknown peer address change state: {}", state),
            };
            let aaddr = raw.aaddr;
            Ok(Some(Notification::PeerAddressChange(PeerAddressChange {
                address: sockaddr_storage_to_addr(&aaddr),
                event,
                error: raw.error as u32,
                assoc_id: raw.assoc_id,
            })))
        }
        SCTP_SEND_FAILED => {
            let raw: SendFailedRaw = read_raw(data)?;
            let unsent_data = data[mem::size_of::<SendFailedRaw>()..].to_vec();
            Ok(Some(Notification::SendFailed(SendFailed {
                error: raw.error,
                stream_id: StreamId(raw.info.stream),
                ppid: PpId(raw.info.ppid),
                unsent_data,
                assoc_id: raw.assoc_id,
            })))
        }
        SCTP_SHUTDOWN_EVENT => {
            let raw: ShutdownEventRaw = read_raw(data)?;
            Ok(Some(Notification::Shutdown(Shutdown { assoc_id: raw.assoc_id })))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_bytes<T: Copy>(value: &T) -> Vec<u8> {
        let ptr = value as *const T as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, mem::size_of::<T>()) }.to_vec()
    }

    #[test]
    fn parses_association_change() {
        let raw = AssocChangeRaw {
            sn_type: SCTP_ASSOC_CHANGE,
            sn_flags: 0,
            sn_length: mem::size_of::<AssocChangeRaw>() as u32,
            state: SCTP_COMM_UP,
            error: 0,
            outbound_streams: 10,
            inbound_streams: 5,
            assoc_id: 42,
        };
        let change = match parse_notification(&as_bytes(&raw)).unwrap().unwrap() {
            Notification::AssociationChange(change) => change,
            other => panic!("expected an association change, got {:?}", other),
        };
        assert_eq!(change.event, AssocChangeEvent::CommUp);
        assert_eq!(change.outbound_streams, 10);
        assert_eq!(change.inbound_streams, 5);
        assert_eq!(change.assoc_id, 42);
    }

    #[test]
    fn parses_shutdown_event() {
        let raw = ShutdownEventRaw {
            sn_type: SCTP_SHUTDOWN_EVENT,
            sn_flags: 0,
            sn_length: mem::size_of::<ShutdownEventRaw>() as u32,
            assoc_id: 7,
        };
        let parsed = parse_notification(&as_bytes(&raw)).unwrap().unwrap();
        assert_eq!(parsed, Notification::Shutdown(Shutdown { assoc_id: 7 }));
    }

    #[test]
    fn parses_send_failed_with_trailing_data() {
        let raw = SendFailedRaw {
            sn_type: SCTP_SEND_FAILED,
            sn_flags: 0,
            sn_length: (mem::size_of::<SendFailedRaw>() + 3) as u32,
            error: 11,
            info: SndRcvInfo { stream: 3, ppid: 99, ..Default::default() },
            assoc_id: 1,
        };
        let mut bytes = as_bytes(&raw);
        bytes.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        let failed = match parse_notification(&bytes).unwrap().unwrap() {
            Notification::SendFailed(failed) => failed,
            other => panic!("expected a send failed notification, got {:?}", other),
        };
        assert_eq!(failed.error, 11);
        assert_eq!(failed.stream_id, StreamId(3));
        assert_eq!(failed.ppid, PpId(99));
        assert_eq!(failed.unsent_data, vec![0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn parses_peer_address_change() {
        let dest: std::net::SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let sockaddr = socket2::SockAddr::from(dest);
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        unsafe {
            ptr::copy_nonoverlapping(
                sockaddr.as_ptr() as *const u8,
                &mut storage as *mut libc::sockaddr_storage as *mut u8,
                sockaddr.len() as usize,
            );
        }
        let raw = PaddrChangeRaw {
            sn_type: SCTP_PEER_ADDR_CHANGE,
            sn_flags: 0,
            sn_length: mem::size_of::<PaddrChangeRaw>() as u32,
            aaddr: storage,
            state: SCTP_ADDR_CONFIRMED,
            error: 0,
            assoc_id: 9,
        };
        let change = match parse_notification(&as_bytes(&raw)).unwrap().unwrap() {
            Notification::PeerAddressChange(change) => change,
            other => panic!("expected a peer address change, got {:?}", other),
        };
        assert_eq!(change.event, PeerAddrEvent::Confirmed);
        assert_eq!(change.address, Some(dest));
        assert_eq!(change.assoc_id, 9);
    }

    #[test]
    fn unsubscribed_types_are_ignored() {
        // Remote error, which the endpoint does not subscribe to.
        let mut bytes = vec![0u8; 16];
        bytes[0..2].copy_from_slice(&0x8004u16.to_ne_bytes());
        assert!(parse_notification(&bytes).unwrap().is_none());
    }

    #[test]
    fn truncated_notification_is_an_error() {
        let bytes = SCTP_ASSOC_CHANGE.to_ne_bytes().to_vec();
        assert!(parse_notification(&bytes).is_err());
    }
}
