//! Inventory and order state machine.
//!
//! Every mutation is one store transaction that re-reads the document under
//! a row lock, checks the guard, and writes back with a bumped version. Two
//! writers racing on the same guard therefore see exactly one winner; the
//! loser gets [`SettlementError::InvalidStatusForUpdate`].

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use bazaar_core::address::Address;
use bazaar_core::types::Hash256;

use crate::error::{QuantityScope, SettlementError};
use crate::model::{
    ActionParams, ActionStatus, NewRound, PendingAction, Reservation, ReservationStatus, RoundStatus,
    SaleRound, StatusExtra, StepId, SubmittedStep, TransactionRecord,
};
use crate::store::{SettlementStore, action_key, reservation_key, round_key, wallet_units_key};

fn new_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

fn not_found(entity: &'static str, id: &str) -> SettlementError {
    SettlementError::NotFound { entity, id: id.to_string() }
}

pub struct StateMachine {
    store: Arc<SettlementStore>,
}

impl StateMachine {
    pub fn new(store: Arc<SettlementStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<SettlementStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    pub fn create_action(&self, params: ActionParams, wallet_index: u32) -> Result<PendingAction, SettlementError> {
        params.validate()?;
        let now = Utc::now();
        let action = PendingAction {
            id: new_id(),
            params,
            status: ActionStatus::Created,
            mode: Default::default(),
            record: TransactionRecord::default(),
            wallet_index,
            last_error: None,
            notes: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        let txn = self.store.transaction();
        txn.put(&action_key(&action.id), &action)?;
        txn.commit()?;
        info!(action_id = %action.id, kind = action.params.label(), wallet_index, "action created");
        Ok(action)
    }

    pub fn get_action(&self, id: &str) -> Result<PendingAction, SettlementError> {
        self.store
            .get(&action_key(id))?
            .ok_or_else(|| not_found("action", id))
    }

    pub fn list_actions(&self, status: Option<ActionStatus>) -> Result<Vec<PendingAction>, SettlementError> {
        let all: Vec<PendingAction> = self.store.actions()?;
        Ok(all
            .into_iter()
            .filter(|a| status.is_none_or(|s| a.status == s))
            .collect())
    }

    /// Set status to `new` only if it is currently `required`.
    pub fn transition_status(
        &self,
        id: &str,
        new: ActionStatus,
        required: ActionStatus,
        extra: StatusExtra,
    ) -> Result<PendingAction, SettlementError> {
        let txn = self.store.transaction();
        let mut action: PendingAction = txn
            .get_for_update(&action_key(id))?
            .ok_or_else(|| not_found("action", id))?;

        if action.status != required {
            debug!(action_id = id, current = %action.status, %required, "status guard mismatch");
            return Err(SettlementError::InvalidStatusForUpdate {
                id: id.to_string(),
                current: action.status.to_string(),
                required: required.to_string(),
            });
        }
        if !required.can_transition_to(new) {
            return Err(SettlementError::IllegalTransition {
                from: required.to_string(),
                to: new.to_string(),
            });
        }

        action.status = new;
        match extra.last_error {
            Some(e) => action.last_error = Some(e),
            None if new.is_terminal() => action.last_error = None,
            None => {}
        }
        if let Some(note) = extra.note {
            action.notes.push(note);
        }
        if let Some(mode) = extra.mode {
            action.mode = mode;
        }
        action.version += 1;
        action.updated_at = Utc::now();

        txn.put(&action_key(id), &action)?;
        txn.commit()?;
        debug!(action_id = id, from = %required, to = %new, "status transition");
        Ok(action)
    }

    /// Append a completed step to a running action's record.
    ///
    /// Recording the same id twice is a no-op; a different id for a recorded
    /// step is refused.
    pub fn record_step(&self, id: &str, step: StepId, txid: Hash256) -> Result<PendingAction, SettlementError> {
        self.update_running_record(id, |record| record.record(step, txid))
    }

    /// Persist a signed step transaction before it is broadcast, so a resume
    /// after an unconfirmed submit resends it instead of building another.
    pub fn record_submitted(&self, id: &str, submitted: SubmittedStep) -> Result<PendingAction, SettlementError> {
        self.update_running_record(id, |record| record.begin_step(submitted))
    }

    fn update_running_record(
        &self,
        id: &str,
        apply: impl FnOnce(&mut TransactionRecord) -> Result<bool, SettlementError>,
    ) -> Result<PendingAction, SettlementError> {
        let txn = self.store.transaction();
        let mut action: PendingAction = txn
            .get_for_update(&action_key(id))?
            .ok_or_else(|| not_found("action", id))?;

        if !action.status.is_running() {
            return Err(SettlementError::InvalidStatusForUpdate {
                id: id.to_string(),
                current: action.status.to_string(),
                required: "in_progress|cancelling".to_string(),
            });
        }
        if !apply(&mut action.record)? {
            return Ok(action);
        }
        action.version += 1;
        action.updated_at = Utc::now();
        txn.put(&action_key(id), &action)?;
        txn.commit()?;
        Ok(action)
    }

    /// Add an audit note. Allowed in every status, terminal included.
    pub fn annotate(&self, id: &str, note: impl Into<String>) -> Result<PendingAction, SettlementError> {
        let txn = self.store.transaction();
        let mut action: PendingAction = txn
            .get_for_update(&action_key(id))?
            .ok_or_else(|| not_found("action", id))?;
        action.notes.push(note.into());
        action.version += 1;
        action.updated_at = Utc::now();
        txn.put(&action_key(id), &action)?;
        txn.commit()?;
        Ok(action)
    }

    // ------------------------------------------------------------------
    // Sale rounds
    // ------------------------------------------------------------------

    pub fn create_round(&self, new: NewRound) -> Result<SaleRound, SettlementError> {
        if new.total_units == 0 {
            return Err(SettlementError::InvalidAmount("round has no units".into()));
        }
        let round = SaleRound {
            id: new_id(),
            round_number: new.round_number,
            total_units: new.total_units,
            available_units: new.total_units,
            min_units_per_order: new.min_units_per_order,
            max_units_per_wallet: new.max_units_per_wallet,
            status: if new.total_units < new.min_units_per_order {
                RoundStatus::NoUnitsLeft
            } else {
                RoundStatus::Active
            },
            version: 1,
            updated_at: Utc::now(),
        };
        let txn = self.store.transaction();
        txn.put(&round_key(&round.id), &round)?;
        txn.commit()?;
        info!(round_id = %round.id, round_number = round.round_number, units = round.total_units, "sale round opened");
        Ok(round)
    }

    pub fn get_round(&self, id: &str) -> Result<SaleRound, SettlementError> {
        self.store.get(&round_key(id))?.ok_or_else(|| not_found("round", id))
    }

    pub fn get_reservation(&self, id: &str) -> Result<Reservation, SettlementError> {
        self.store
            .get(&reservation_key(id))?
            .ok_or_else(|| not_found("reservation", id))
    }

    pub fn reservations_for_round(&self, round_id: &str) -> Result<Vec<Reservation>, SettlementError> {
        let all: Vec<Reservation> = self.store.reservations()?;
        Ok(all.into_iter().filter(|r| r.round_id == round_id).collect())
    }

    /// Reserve up to `requested` units of `round_id` for `wallet`.
    ///
    /// Reserves `min(requested, available, remaining wallet cap)`. The round
    /// flips to no-units-left once fewer than `min_units_per_order` remain.
    /// Any failure leaves the round untouched.
    pub fn reserve_inventory(
        &self,
        round_id: &str,
        requested: u64,
        wallet: &Address,
    ) -> Result<(SaleRound, Reservation), SettlementError> {
        if requested == 0 {
            return Err(SettlementError::InvalidAmount("requested zero units".into()));
        }
        let wallet_str = wallet.to_string();
        let units_key = wallet_units_key(round_id, &wallet_str);

        let txn = self.store.transaction();
        let mut round: SaleRound = txn
            .get_for_update(&round_key(round_id))?
            .ok_or_else(|| not_found("round", round_id))?;
        let held: u64 = txn.get_for_update(&units_key)?.unwrap_or(0);

        let available = if round.status == RoundStatus::Active { round.available_units } else { 0 };
        let wallet_room = round
            .max_units_per_wallet
            .map_or(u64::MAX, |cap| cap.saturating_sub(held));
        let amount = requested.min(available).min(wallet_room);
        if amount == 0 {
            let scope = if available > 0 { QuantityScope::Wallet } else { QuantityScope::Pool };
            debug!(round_id, wallet = %wallet_str, requested, %scope, "reservation refused");
            return Err(SettlementError::NotEnoughAvailable { scope });
        }

        let now = Utc::now();
        round.available_units -= amount;
        if round.available_units < round.min_units_per_order || round.available_units == 0 {
            round.status = RoundStatus::NoUnitsLeft;
        }
        round.version += 1;
        round.updated_at = now;

        let reservation = Reservation {
            id: new_id(),
            round_id: round_id.to_string(),
            wallet: wallet.clone(),
            units: amount,
            status: ReservationStatus::Reserved,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        txn.put(&round_key(round_id), &round)?;
        txn.put(&units_key, &(held + amount))?;
        txn.put(&reservation_key(&reservation.id), &reservation)?;
        txn.commit()?;

        info!(
            round_id,
            reservation_id = %reservation.id,
            units = amount,
            remaining = round.available_units,
            "inventory reserved"
        );
        Ok((round, reservation))
    }

    /// Return a reservation's units to its round.
    ///
    /// Only a `Reserved` reservation can be cancelled. A round that ran out
    /// becomes active again once `min_units_per_order` units are back.
    pub fn cancel_reservation(&self, reservation_id: &str) -> Result<(SaleRound, Reservation), SettlementError> {
        let txn = self.store.transaction();
        let mut reservation: Reservation = txn
            .get_for_update(&reservation_key(reservation_id))?
            .ok_or_else(|| not_found("reservation", reservation_id))?;
        if reservation.status != ReservationStatus::Reserved {
            return Err(SettlementError::InvalidStatusForUpdate {
                id: reservation_id.to_string(),
                current: reservation.status.to_string(),
                required: ReservationStatus::Reserved.to_string(),
            });
        }

        let mut round: SaleRound = txn
            .get_for_update(&round_key(&reservation.round_id))?
            .ok_or_else(|| not_found("round", &reservation.round_id))?;
        let units_key = wallet_units_key(&reservation.round_id, &reservation.wallet.to_string());
        let held: u64 = txn.get_for_update(&units_key)?.unwrap_or(0);

        let now = Utc::now();
        round.available_units = round
            .available_units
            .saturating_add(reservation.units)
            .min(round.total_units);
        if round.status == RoundStatus::NoUnitsLeft
            && round.available_units >= round.min_units_per_order.max(1)
        {
            round.status = RoundStatus::Active;
        }
        round.version += 1;
        round.updated_at = now;

        reservation.status = ReservationStatus::Cancelled;
        reservation.version += 1;
        reservation.updated_at = now;

        txn.put(&round_key(&round.id), &round)?;
        txn.put(&units_key, &held.saturating_sub(reservation.units))?;
        txn.put(&reservation_key(reservation_id), &reservation)?;
        txn.commit()?;

        info!(round_id = %round.id, reservation_id, units = reservation.units, "reservation cancelled");
        Ok((round, reservation))
    }

    pub fn complete_reservation(&self, reservation_id: &str) -> Result<Reservation, SettlementError> {
        let txn = self.store.transaction();
        let mut reservation: Reservation = txn
            .get_for_update(&reservation_key(reservation_id))?
            .ok_or_else(|| not_found("reservation", reservation_id))?;
        if reservation.status != ReservationStatus::Reserved {
            return Err(SettlementError::InvalidStatusForUpdate {
                id: reservation_id.to_string(),
                current: reservation.status.to_string(),
                required: ReservationStatus::Reserved.to_string(),
            });
        }
        reservation.status = ReservationStatus::Completed;
        reservation.version += 1;
        reservation.updated_at = Utc::now();
        txn.put(&reservation_key(reservation_id), &reservation)?;
        txn.commit()?;
        Ok(reservation)
    }

    pub fn close_round(&self, round_id: &str) -> Result<SaleRound, SettlementError> {
        let txn = self.store.transaction();
        let mut round: SaleRound = txn
            .get_for_update(&round_key(round_id))?
            .ok_or_else(|| not_found("round", round_id))?;
        round.status = RoundStatus::Closed;
        round.version += 1;
        round.updated_at = Utc::now();
        txn.put(&round_key(round_id), &round)?;
        txn.commit()?;
        Ok(round)
    }
}
