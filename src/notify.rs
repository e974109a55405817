use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, BookingId, CourtId, VenueId};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeAction {
    Created,
    Confirmed,
    Cancelled,
    Expired,
}

/// What subscribers hear after a lifecycle transition. Serialized as JSON for
/// SQL `NOTIFY` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingNotice {
    pub booking_id: BookingId,
    pub court_id: CourtId,
    pub venue_id: VenueId,
    pub action: NoticeAction,
    pub snapshot: Booking,
}

impl BookingNotice {
    pub fn new(booking: &Booking, action: NoticeAction) -> Self {
        Self {
            booking_id: booking.id,
            court_id: booking.court_id,
            venue_id: booking.venue_id,
            action,
            snapshot: booking.clone(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// LISTEN channel name for a venue.
pub fn channel_name(venue_id: &VenueId) -> String {
    format!("venue_{venue_id}")
}

/// Inverse of `channel_name`.
pub fn parse_channel(channel: &str) -> Option<VenueId> {
    let id = channel.strip_prefix("venue_")?;
    Ulid::from_string(&id.to_ascii_uppercase()).ok()
}

/// Per-venue broadcast hub. Delivery is fire-and-forget: publishing never
/// blocks and a lagging subscriber loses the oldest notices.
pub struct NotifyHub {
    channels: DashMap<VenueId, broadcast::Sender<BookingNotice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    pub fn subscribe(&self, venue_id: VenueId) -> broadcast::Receiver<BookingNotice> {
        self.channels
            .entry(venue_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody is listening on the venue.
    pub fn publish(&self, notice: &BookingNotice) {
        if let Some(sender) = self.channels.get(&notice.venue_id)
            && sender.send(notice.clone()).is_err()
        {
            tracing::debug!("no live listeners for venue {}", notice.venue_id);
        }
    }

    /// Drop a venue's channel once its last listener is gone.
    pub fn remove_if_idle(&self, venue_id: &VenueId) {
        self.channels
            .remove_if(venue_id, |_, sender| sender.receiver_count() == 0);
    }
}
