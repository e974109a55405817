use rand::Rng;
use rand::distributions::Alphanumeric;

use crate::limits::*;
use crate::model::*;
use crate::notify::NoticeAction;
use crate::observability::*;

use super::conflict::{check_no_conflict, is_lapsed, occupies_slot, validate_slot};
use super::pricing::resolve_price;
use super::{Engine, EngineError};

/// Human-shareable payment reference: `BK` + random token + unix seconds.
pub(crate) fn payment_code(now: Ms) -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PAYMENT_CODE_RANDOM_LEN)
        .map(char::from)
        .collect();
    format!("BK{}{}", token.to_ascii_uppercase(), now.div_euclid(1000))
}

impl Engine {
    /// Place a pending hold on a slot. The hold occupies the slot until it is
    /// confirmed, cancelled, or its expiry passes.
    pub async fn initiate_booking(&self, req: BookingRequest) -> Result<HoldReceipt, EngineError> {
        let booking = self.place(req, BookingStatus::Pending).await?;
        metrics::counter!(HOLDS_PLACED_TOTAL).increment(1);
        tracing::info!(
            "hold {} placed on court {} {} {} until {:?}",
            booking.id,
            booking.court_id,
            booking.date,
            booking.range,
            booking.pending_expires_at
        );
        Ok(HoldReceipt {
            booking_id: booking.id,
            payment_code: booking.payment_code.unwrap_or_default(),
            expires_at: booking.pending_expires_at.unwrap_or_default(),
            total_price: booking.total_price,
        })
    }

    /// Owner's counter booking: skips the hold and lands directly in
    /// `confirmed`, paid.
    pub async fn create_walk_in(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let booking = self.place(req, BookingStatus::Confirmed).await?;
        metrics::counter!(WALK_INS_TOTAL).increment(1);
        tracing::info!(
            "walk-in {} booked on court {} {} {} for {}",
            booking.id,
            booking.court_id,
            booking.date,
            booking.range,
            booking.holder.label()
        );
        Ok(booking)
    }

    async fn place(&self, req: BookingRequest, status: BookingStatus) -> Result<Booking, EngineError> {
        match self.try_place(&req, status).await {
            Err(EngineError::StorageConflict(court_id)) => {
                tracing::debug!("court {court_id} changed under request {}, retrying", req.id);
                self.try_place(&req, status).await
            }
            other => other,
        }
    }

    /// Check and insert under the court's write lock, so two requests for the
    /// same slot can never both pass the conflict check.
    async fn try_place(&self, req: &BookingRequest, status: BookingStatus) -> Result<Booking, EngineError> {
        if self.booking_index.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let mut guard = self.lock_court(&req.court_id).await?;
        if !guard.active {
            return Err(EngineError::CourtInactive(req.court_id));
        }
        if self.booking_index.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        let now = self.now();
        validate_slot(req.date, self.local_now().date())?;
        let live = guard
            .day(req.date)
            .iter()
            .filter(|b| occupies_slot(b, now))
            .count();
        if live >= MAX_BOOKINGS_PER_COURT_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on court for the day"));
        }

        // Retire this court's lapsed holds first so the sheet reflects reality.
        if let Err(e) = self.expire_lapsed_on(&mut guard, now).await {
            tracing::warn!("pre-booking lapse sweep on court {} failed: {e}", req.court_id);
        }

        if let Err(e) = check_no_conflict(&guard, req.date, &req.range, now) {
            metrics::counter!(SLOT_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let total_price = match req.price_override {
            Some(price) => price,
            None => resolve_price(&guard.schedules, req.date, &req.range).ok_or(
                EngineError::NoPricing {
                    court_id: req.court_id,
                    date: req.date,
                    range: req.range,
                },
            )?,
        };
        if total_price < 0 {
            return Err(EngineError::InvalidSlot("price must not be negative"));
        }

        let pending = status == BookingStatus::Pending;
        let booking = Booking {
            id: req.id,
            court_id: req.court_id,
            venue_id: guard.venue_id,
            date: req.date,
            range: req.range,
            holder: req.holder.clone(),
            status,
            is_paid: !pending,
            payment_code: Some(payment_code(now)),
            pending_expires_at: pending.then_some(now + self.settings.hold_ttl_ms),
            total_price,
            is_for_transfer: false,
            transfer_status: None,
            transfer_price: None,
            created_at: now,
        };

        let event = Event::BookingPlaced {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        self.publish(&booking, NoticeAction::Created);
        Ok(booking)
    }

    /// Resolve a hold into a confirmed, paid booking.
    ///
    /// A hold whose expiry is at or before now is cancelled instead and the
    /// caller gets `HoldExpired`.
    pub async fn confirm_booking(&self, id: BookingId, actor: UserId) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let now = self.now();
        let hold = guard
            .booking(&id)
            .filter(|b| b.status == BookingStatus::Pending && b.holder.is_user(actor))
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        if is_lapsed(&hold, now) {
            let event = Event::HoldExpired {
                id,
                court_id: hold.court_id,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            if let Some(snapshot) = guard.booking(&id) {
                self.publish(snapshot, NoticeAction::Expired);
            }
            metrics::counter!(HOLDS_EXPIRED_TOTAL).increment(1);
            tracing::info!("hold {id} expired before confirmation");
            return Err(EngineError::HoldExpired {
                id,
                expired_at: hold.pending_expires_at.unwrap_or(now),
            });
        }

        let event = Event::BookingConfirmed {
            id,
            court_id: hold.court_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let confirmed = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        self.publish(&confirmed, NoticeAction::Confirmed);
        metrics::counter!(BOOKINGS_CONFIRMED_TOTAL).increment(1);
        tracing::info!("booking {id} confirmed, payment {:?}", confirmed.payment_code);
        Ok(confirmed)
    }

    /// Release a hold the actor owns.
    pub async fn cancel_booking(&self, id: BookingId, actor: UserId) -> Result<(), EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let hold = guard
            .booking(&id)
            .filter(|b| b.status == BookingStatus::Pending && b.holder.is_user(actor))
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        let event = Event::BookingCancelled {
            id,
            court_id: hold.court_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        if let Some(snapshot) = guard.booking(&id) {
            self.publish(snapshot, NoticeAction::Cancelled);
        }
        metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1);
        tracing::info!("hold {id} cancelled by holder");
        Ok(())
    }

    /// Offer a confirmed booking on the resale marketplace.
    pub async fn mark_for_transfer(
        &self,
        id: BookingId,
        actor: UserId,
        price: Option<Price>,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard
            .booking(&id)
            .filter(|b| b.holder.is_user(actor))
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::TransferNotAllowed(
                "only confirmed bookings can be transferred",
            ));
        }
        if booking.transfer_status == Some(TransferStatus::Available) {
            return Err(EngineError::TransferNotAllowed("booking is already listed"));
        }
        if price.is_some_and(|p| p < 0) {
            return Err(EngineError::TransferNotAllowed("price must not be negative"));
        }

        let event = Event::TransferListed {
            id,
            court_id: booking.court_id,
            price,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("booking {id} listed for transfer at {price:?}");
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Hand a listed booking over to `buyer`.
    pub async fn purchase_transfer(&self, id: BookingId, buyer: UserId) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_booking_write(&id).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.status != BookingStatus::Confirmed
            || !booking.is_for_transfer
            || booking.transfer_status != Some(TransferStatus::Available)
        {
            return Err(EngineError::TransferNotAllowed(
                "booking is not available for transfer",
            ));
        }
        if booking.holder.is_user(buyer) {
            return Err(EngineError::TransferNotAllowed("cannot buy your own booking"));
        }

        let event = Event::TransferPurchased {
            id,
            court_id: booking.court_id,
            buyer,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(TRANSFERS_TOTAL).increment(1);
        tracing::info!("booking {id} transferred from {} to {buyer}", booking.holder.label());
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_code_shape() {
        let code = payment_code(1_772_352_000_000);
        assert!(code.starts_with("BK"));
        assert!(code.ends_with("1772352000"));
        let token = &code[2..2 + PAYMENT_CODE_RANDOM_LEN];
        assert!(token.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn payment_codes_differ() {
        let a = payment_code(1_000);
        let b = payment_code(1_000);
        assert_ne!(a, b);
    }
}
