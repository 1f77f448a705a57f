// src/transfer.rs

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer interrupted: {0}")]
    Interrupted(String),
    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// The unit of work behind one download. Each call to `advance` moves the
/// transfer forward by one step and reports how many percent it covered.
///
/// Implementations should return a bounded positive increment so the task
/// eventually saturates; the worker clamps the running total at 100.
pub trait Transfer: Send {
    fn advance(&mut self) -> Result<u8, TransferError>;
}

/// Opens a transfer for a submitted URL.
pub trait TransferFactory: Send + Sync {
    fn open(&self, url: &str) -> Box<dyn Transfer>;
}

/// Stand-in transfers that advance by a random `1..=max_increment` percent
/// per step and fail with probability `failure_rate` per step.
pub struct SimulatedTransfers {
    max_increment: u8,
    failure_rate: f64,
    seeds: Option<Mutex<StdRng>>,
}

impl SimulatedTransfers {
    pub fn new(max_increment: u8, failure_rate: f64) -> Self {
        Self {
            max_increment: max_increment.clamp(1, 100),
            failure_rate: failure_rate.clamp(0.0, 1.0),
            seeds: None,
        }
    }

    /// Makes every opened transfer deterministic, derived from `seed`.
    pub fn seeded(mut self, seed: u64) -> Self {
        self.seeds = Some(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    fn rng(&self) -> StdRng {
        match &self.seeds {
            Some(seeds) => {
                let mut seeds = seeds.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                StdRng::seed_from_u64(seeds.gen())
            }
            None => StdRng::from_entropy(),
        }
    }
}

impl Default for SimulatedTransfers {
    fn default() -> Self {
        Self::new(40, 0.0)
    }
}

impl TransferFactory for SimulatedTransfers {
    fn open(&self, url: &str) -> Box<dyn Transfer> {
        Box::new(SimulatedTransfer {
            url: url.to_string(),
            max_increment: self.max_increment,
            failure_rate: self.failure_rate,
            rng: self.rng(),
        })
    }
}

struct SimulatedTransfer {
    url: String,
    max_increment: u8,
    failure_rate: f64,
    rng: StdRng,
}

impl Transfer for SimulatedTransfer {
    fn advance(&mut self) -> Result<u8, TransferError> {
        if self.failure_rate > 0.0 && self.rng.gen_bool(self.failure_rate) {
            return Err(TransferError::Interrupted(format!(
                "simulated failure while fetching {}",
                self.url
            )));
        }
        Ok(self.rng.gen_range(1..=self.max_increment))
    }
}
