use tokio::sync::oneshot;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, SchedulerError, WalCommand};

/// Minimal events that rebuild one specialist: template, slots as they are
/// now (occupancy included), then bookings without touching occupancy.
fn snapshot_specialist(st: &SpecialistState, events: &mut Vec<Event>) {
    if let Some(template) = &st.template {
        events.push(Event::TemplateReplaced {
            template: template.clone(),
        });
    }
    if !st.slots.is_empty() {
        events.push(Event::SlotsCreated {
            specialist_id: st.id,
            slots: st.slots.clone(),
        });
    }
    let mut bookings: Vec<&Booking> = st.bookings.values().collect();
    bookings.sort_by_key(|b| (b.created_at, b.id));
    events.extend(bookings.into_iter().map(|b| Event::BookingRestored {
        booking: b.clone(),
    }));
}

impl Engine {
    /// Rewrite the log as a snapshot of the current state. Blocks every
    /// transaction for the duration.
    pub async fn compact_wal(&self) -> Result<(), SchedulerError> {
        let _gate = self.commit_gate.write().await;

        let mut ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        let mut events = Vec::new();
        for id in ids {
            if let Some(rs) = self.get_specialist(&id) {
                let guard = rs.read().await;
                snapshot_specialist(&guard, &mut events);
            }
        }
        let snapshot_len = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| SchedulerError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulerError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| SchedulerError::Storage(e.to_string()))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        tracing::info!(events = snapshot_len, "compacted scheduler log");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
