//! Ingestion collaborator port.
//!
//! Document download and extraction happen upstream; the engine only sees
//! the extracted rows.

use crate::domain::error::CamelsError;
use crate::domain::observation::ObservationRecord;
use crate::domain::reference::Bank;

pub trait ObservationSource {
    /// Seed registry of banks.
    fn load_banks(&self) -> Result<Vec<Bank>, CamelsError>;

    /// Extracted observation rows, unvalidated.
    fn load_observations(&self) -> Result<Vec<ObservationRecord>, CamelsError>;
}
