//! Notification bookkeeping.
//!
//! The eUICC numbers its notifications with a per-card counter. Capturing
//! the highest number before a destructive operation (the high-water mark)
//! tells us afterwards which notifications that operation produced.

use simdeck_common::models::{Iccid, NotificationOperation, SequenceNumber};

use super::client::NotificationMetadata;
use super::LpaSession;
use crate::error::{Error, Result};

/// Highest sequence number in `notifications`, 0 when empty.
pub fn high_water_mark(notifications: &[NotificationMetadata]) -> SequenceNumber {
    notifications
        .iter()
        .map(|n| n.sequence_number)
        .max()
        .unwrap_or(0)
}

/// Collects per-notification failures across a batch.
#[derive(Debug, Default)]
struct Batch {
    sequences: Vec<SequenceNumber>,
    failures: Vec<String>,
}

impl Batch {
    fn finish(self) -> Result<Vec<SequenceNumber>> {
        if self.failures.is_empty() {
            Ok(self.sequences)
        } else {
            Err(Error::PartialNotificationFailure {
                sequences: self.sequences,
                failures: self.failures,
            })
        }
    }
}

impl LpaSession {
    pub async fn high_water_mark(&mut self) -> Result<SequenceNumber> {
        Ok(high_water_mark(&self.list_notifications().await?))
    }

    /// Retrieve notification `sequence` and send it to its SM-DP+.
    pub(super) async fn deliver(&mut self, sequence: SequenceNumber) -> Result<()> {
        let client = self.client()?;
        let found = client
            .retrieve_notification_list(sequence)
            .await
            .map_err(|e| Error::Protocol(format!("unable to retrieve notification {sequence}: {e}")))?;
        if let Some(notification) = found.first() {
            client
                .handle_notification(notification)
                .await
                .map_err(|e| Error::Protocol(format!("unable to handle notification {sequence}: {e}")))?;
        }
        Ok(())
    }

    /// Deliver notification `sequence` again.
    pub async fn resend_notification(&mut self, sequence: SequenceNumber) -> Result<()> {
        let client = self.client()?;
        let found = client.retrieve_notification_list(sequence).await?;
        if found.is_empty() {
            return Err(Error::InvalidInput(format!(
                "notification {sequence} not found"
            )));
        }
        let mut failures = Vec::new();
        for notification in &found {
            if let Err(e) = client.handle_notification(notification).await {
                failures.push(format!("handle {}: {e}", notification.sequence_number));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PartialNotificationFailure {
                sequences: found.iter().map(|n| n.sequence_number).collect(),
                failures,
            })
        }
    }

    /// Delete a profile and deliver the delete notification it produced.
    ///
    /// Returns the sequence numbers that were attempted. If any of them
    /// failed the profile is still gone and the error lists both the attempts
    /// and the failures.
    pub async fn delete_profile(&mut self, iccid: &Iccid) -> Result<Vec<SequenceNumber>> {
        let mark = self.high_water_mark().await?;
        self.client()?.delete_profile(iccid).await?;

        let deletes = self
            .client()?
            .list_notification(Some(NotificationOperation::Delete))
            .await?;

        let mut batch = Batch::default();
        for notification in deletes
            .iter()
            .filter(|n| n.sequence_number > mark && &n.iccid == iccid)
        {
            let sequence = notification.sequence_number;
            tracing::info!(modem = %self.identity, sequence, "sending deletion notification");
            if let Err(e) = self.deliver(sequence).await {
                batch.failures.push(e.to_string());
            }
            batch.sequences.push(sequence);
        }
        batch.finish()
    }

    /// Deliver and then remove every notification newer than `mark`.
    pub async fn replay_after(&mut self, mark: SequenceNumber) -> Result<Vec<SequenceNumber>> {
        let pending = self.list_notifications().await?;

        let mut batch = Batch::default();
        for notification in pending.iter().filter(|n| n.sequence_number > mark) {
            let sequence = notification.sequence_number;
            tracing::info!(
                modem = %self.identity,
                sequence,
                operation = %notification.operation,
                "sending pending notification"
            );
            batch.sequences.push(sequence);
            if let Err(e) = self.deliver(sequence).await {
                batch.failures.push(e.to_string());
                continue;
            }
            if let Err(e) = self.client()?.remove_notification_from_list(sequence).await {
                batch
                    .failures
                    .push(format!("unable to remove notification {sequence}: {e}"));
            }
        }
        batch.finish()
    }
}
