//! The local store capability the coordinator consumes: an in-memory
//! repository of doctors, beds, patients and visits, with the transaction
//! (begin/commit/rollback) discipline `run_leader_gated_txn` drives.
//!
//! This is deliberately out of the correctness-critical core (§1 of the
//! spec treats the relational schema as an external collaborator); it
//! exists only so the coordinator and its tests have a real `work` target.
//! Grounded in `backend/src/models.py`'s `Doctor` (`disponible`), `Cama`
//! (`ocupada`, `id_paciente`) and `VisitaEmergencia` (`estado`) tables from
//! the original program.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type DoctorId = u64;
pub type BedId = u64;
pub type PatientId = u64;
pub type VisitId = u64;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Doctor {
    pub id: DoctorId,
    pub name: String,
    pub specialty: String,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bed {
    pub id: BedId,
    pub ward: u32,
    pub occupied: bool,
    pub patient_id: Option<PatientId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub id: PatientId,
    pub name: String,
    pub arrival_reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VisitStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Visit {
    pub id: VisitId,
    pub patient_id: PatientId,
    pub doctor_id: DoctorId,
    pub bed_id: BedId,
    pub status: VisitStatus,
    pub opened_at: f64,
    pub closed_at: Option<f64>,
}

/// A new patient being admitted as part of opening a visit.
#[derive(Debug, Clone)]
pub struct NewPatient {
    pub name: String,
    pub arrival_reason: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("no doctor is available")]
    NoAvailableDoctor,
    #[error("no bed is available")]
    NoAvailableBed,
    #[error("visit {0} does not exist")]
    UnknownVisit(VisitId),
    #[error("visit {0} is already closed")]
    VisitAlreadyClosed(VisitId),
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

#[derive(Debug, Clone, Default)]
struct StoreData {
    doctors: BTreeMap<DoctorId, Doctor>,
    beds: BTreeMap<BedId, Bed>,
    patients: BTreeMap<PatientId, Patient>,
    visits: BTreeMap<VisitId, Visit>,
    next_patient_id: PatientId,
    next_visit_id: VisitId,
}

/// A bounded view of the store, opened by [`LocalStore::begin`] and
/// consumed by exactly one of [`LocalStore::commit`] or
/// [`LocalStore::rollback`]. Moving it into `commit`/`rollback` (rather
/// than taking it by reference) makes re-use after either call a compile
/// error, standing in for the source's implicit "don't touch this
/// connection again" discipline.
#[derive(Debug, Clone)]
pub struct Transaction {
    data: StoreData,
}

impl Transaction {
    pub fn available_doctor_count(&self) -> usize {
        self.data.doctors.values().filter(|d| d.available).count()
    }

    pub fn available_bed_count(&self) -> usize {
        self.data.beds.values().filter(|b| !b.occupied).count()
    }

    /// Atomically allocates one available doctor and one available bed to a
    /// newly admitted patient, opening a visit. Fails without mutating
    /// anything if either resource is unavailable.
    pub fn create_visit(&mut self, patient: NewPatient) -> Result<VisitId, StoreError> {
        let doctor_id = self
            .data
            .doctors
            .values()
            .find(|d| d.available)
            .map(|d| d.id)
            .ok_or(StoreError::NoAvailableDoctor)?;
        let bed_id = self
            .data
            .beds
            .values()
            .find(|b| !b.occupied)
            .map(|b| b.id)
            .ok_or(StoreError::NoAvailableBed)?;

        let patient_id = self.data.next_patient_id;
        self.data.next_patient_id += 1;
        self.data.patients.insert(
            patient_id,
            Patient { id: patient_id, name: patient.name, arrival_reason: patient.arrival_reason },
        );

        self.data.doctors.get_mut(&doctor_id).unwrap().available = false;
        let bed = self.data.beds.get_mut(&bed_id).unwrap();
        bed.occupied = true;
        bed.patient_id = Some(patient_id);

        let visit_id = self.data.next_visit_id;
        self.data.next_visit_id += 1;
        self.data.visits.insert(
            visit_id,
            Visit {
                id: visit_id,
                patient_id,
                doctor_id,
                bed_id,
                status: VisitStatus::Active,
                opened_at: now_secs(),
                closed_at: None,
            },
        );
        Ok(visit_id)
    }

    /// Frees the visit's doctor and bed and marks it closed.
    pub fn close_visit(&mut self, visit_id: VisitId) -> Result<(), StoreError> {
        let visit = self
            .data
            .visits
            .get(&visit_id)
            .ok_or(StoreError::UnknownVisit(visit_id))?
            .clone();
        if visit.status == VisitStatus::Completed {
            return Err(StoreError::VisitAlreadyClosed(visit_id));
        }

        if let Some(doctor) = self.data.doctors.get_mut(&visit.doctor_id) {
            doctor.available = true;
        }
        if let Some(bed) = self.data.beds.get_mut(&visit.bed_id) {
            bed.occupied = false;
            bed.patient_id = None;
        }

        let visit = self.data.visits.get_mut(&visit_id).unwrap();
        visit.status = VisitStatus::Completed;
        visit.closed_at = Some(now_secs());
        Ok(())
    }

    pub fn visit(&self, visit_id: VisitId) -> Option<&Visit> {
        self.data.visits.get(&visit_id)
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// The capability `run_leader_gated_txn` drives: begin a transaction,
/// mutate it, then commit or roll it back.
pub trait LocalStore: Send + Sync {
    fn begin(&self) -> Transaction;
    /// Commits `tx`, returning `Err` (without discarding the mutation) if
    /// the underlying store could not durably apply it. The in-memory
    /// implementation below never fails; the `Result` exists for stores
    /// with a real commit boundary (a replicated log, a file on disk).
    fn commit(&self, tx: Transaction) -> Result<(), StoreError>;
    fn rollback(&self, tx: Transaction);
}

/// An in-memory store behind a single lock. Sufficient for a single-node
/// deployment and for the in-process multi-node test harness; it is not a
/// replicated store (see Non-goals) and nothing here survives a restart.
pub struct InMemoryStore {
    state: parking_lot::Mutex<StoreData>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { state: parking_lot::Mutex::new(StoreData::default()) }
    }

    pub fn seed_doctor(&self, id: DoctorId, name: impl Into<String>, specialty: impl Into<String>) {
        let mut state = self.state.lock();
        state.doctors.insert(
            id,
            Doctor { id, name: name.into(), specialty: specialty.into(), available: true },
        );
    }

    pub fn seed_bed(&self, id: BedId, ward: u32) {
        let mut state = self.state.lock();
        state.beds.insert(id, Bed { id, ward, occupied: false, patient_id: None });
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for InMemoryStore {
    fn begin(&self) -> Transaction {
        Transaction { data: self.state.lock().clone() }
    }

    fn commit(&self, tx: Transaction) -> Result<(), StoreError> {
        *self.state.lock() = tx.data;
        Ok(())
    }

    fn rollback(&self, tx: Transaction) {
        drop(tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded_store() -> InMemoryStore {
        let store = InMemoryStore::new();
        store.seed_doctor(1, "Dr. Alvarez", "Emergency Medicine");
        store.seed_bed(1, 3);
        store
    }

    #[test]
    fn create_visit_allocates_doctor_and_bed() {
        let store = seeded_store();
        let mut tx = store.begin();
        let visit_id = tx
            .create_visit(NewPatient { name: "J. Doe".into(), arrival_reason: "chest pain".into() })
            .unwrap();
        assert_eq!(tx.available_doctor_count(), 0);
        assert_eq!(tx.available_bed_count(), 0);
        store.commit(tx).unwrap();

        let tx2 = store.begin();
        assert_eq!(tx2.visit(visit_id).unwrap().status, VisitStatus::Active);
    }

    #[test]
    fn create_visit_fails_without_available_doctor() {
        let store = InMemoryStore::new();
        store.seed_bed(1, 1);
        let mut tx = store.begin();
        let err = tx
            .create_visit(NewPatient { name: "A".into(), arrival_reason: "x".into() })
            .unwrap_err();
        assert_eq!(err, StoreError::NoAvailableDoctor);
    }

    #[test]
    fn rollback_discards_mutations() {
        let store = seeded_store();
        let mut tx = store.begin();
        tx.create_visit(NewPatient { name: "A".into(), arrival_reason: "x".into() }).unwrap();
        store.rollback(tx);

        let tx2 = store.begin();
        assert_eq!(tx2.available_doctor_count(), 1);
        assert_eq!(tx2.available_bed_count(), 1);
    }

    #[test]
    fn close_visit_frees_doctor_and_bed() {
        let store = seeded_store();
        let mut tx = store.begin();
        let visit_id = tx
            .create_visit(NewPatient { name: "A".into(), arrival_reason: "x".into() })
            .unwrap();
        store.commit(tx).unwrap();

        let mut tx = store.begin();
        tx.close_visit(visit_id).unwrap();
        assert_eq!(tx.available_doctor_count(), 1);
        assert_eq!(tx.available_bed_count(), 1);
        store.commit(tx).unwrap();
    }

    #[test]
    fn close_visit_twice_errors() {
        let store = seeded_store();
        let mut tx = store.begin();
        let visit_id = tx
            .create_visit(NewPatient { name: "A".into(), arrival_reason: "x".into() })
            .unwrap();
        tx.close_visit(visit_id).unwrap();
        let err = tx.close_visit(visit_id).unwrap_err();
        assert_eq!(err, StoreError::VisitAlreadyClosed(visit_id));
    }
}
