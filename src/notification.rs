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

use crate::api::Attachment;
use crate::api::HandlerResult;
use crate::api::Notification;
use crate::api::NotificationEvent;
use crate::api::NotificationHandler;
use crate::channel::Core;
use crate::channel::SctpChannel;
use std::sync::Weak;

/// Handles every notification by publishing a user event on the channel's pipeline.
///
/// A shutdown notification is terminal from the peer's perspective; continuing to read
/// would deliver messages on a dead association, so the handler additionally closes the
/// channel and stops the current receive.
pub struct SctpNotificationHandler {
    channel: Weak<Core>,
}

impl SctpNotificationHandler {
    pub(crate) fn new(channel: Weak<Core>) -> SctpNotificationHandler {
        SctpNotificationHandler { channel }
    }

    fn channel(&self) -> Option<SctpChannel> {
        self.channel.upgrade().map(SctpChannel::from_core)
    }
}

impl NotificationHandler for SctpNotificationHandler {
    fn handle_notification(
        &self,
        notification: Notification,
        attachment: Option<Attachment>,
    ) -> HandlerResult {
        let Some(channel) = self.channel() else {
            return HandlerResult::Return;
        };
        let is_shutdown = matches!(notification, Notification::Shutdown(_));
        channel.fire_user_event(NotificationEvent { notification, attachment });
        if is_shutdown {
            channel.close_on_shutdown();
            HandlerResult::Return
        } else {
            HandlerResult::Continue
        }
    }
}
