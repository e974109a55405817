use std::sync::Arc;

use tokio::sync::RwLock;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn create_court(
        &self,
        id: CourtId,
        venue_id: VenueId,
        name: String,
    ) -> Result<(), EngineError> {
        // Held across the WAL write so the duplicate check and the insert
        // are one step.
        let _registry = self.registry.lock().await;
        if self.courts.len() >= MAX_COURTS {
            return Err(EngineError::LimitExceeded("too many courts"));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("court name too long"));
        }
        if self.courts.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::CourtCreated {
            id,
            venue_id,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        let cs = CourtState::new(id, venue_id, name);
        self.courts.insert(id, Arc::new(RwLock::new(cs)));
        tracing::info!("court {id} created in venue {venue_id}");
        Ok(())
    }

    /// Rename or (de)activate a court. Inactive courts refuse new bookings but
    /// keep their existing ones.
    pub async fn update_court(
        &self,
        id: CourtId,
        name: String,
        active: bool,
    ) -> Result<(), EngineError> {
        if name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("court name too long"));
        }
        let mut guard = self.lock_court(&id).await?;
        let event = Event::CourtUpdated { id, name, active };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Delete a court. Blocked while any non-cancelled booking references it.
    pub async fn delete_court(&self, id: CourtId) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let mut guard = self.lock_court(&id).await?;
        if guard
            .bookings()
            .any(|b| b.status != BookingStatus::Cancelled)
        {
            return Err(EngineError::HasBookings(id));
        }

        let event = Event::CourtDeleted { id };
        self.wal_append(&event).await?;
        guard.retired = true;
        for b in guard.bookings() {
            self.booking_index.remove(&b.id);
        }
        self.courts.remove(&id);
        tracing::info!("court {id} deleted");
        Ok(())
    }

    pub async fn list_courts(&self) -> Vec<CourtInfo> {
        let handles: Vec<_> = self.courts.iter().map(|e| e.value().clone()).collect();
        let mut courts = Vec::with_capacity(handles.len());
        for rs in handles {
            let guard = rs.read().await;
            courts.push(CourtInfo {
                id: guard.id,
                venue_id: guard.venue_id,
                name: guard.name.clone(),
                active: guard.active,
            });
        }
        courts
    }

    pub async fn court_info(&self, id: CourtId) -> Option<CourtInfo> {
        let rs = self.get_court(&id)?;
        let guard = rs.read().await;
        Some(CourtInfo {
            id: guard.id,
            venue_id: guard.venue_id,
            name: guard.name.clone(),
            active: guard.active,
        })
    }
}
