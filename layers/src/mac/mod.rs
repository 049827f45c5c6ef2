//! Medium Access Control (MAC) Layer Implementation
//!
//! Slot-driven gNB MAC scheduler core (3GPP TS 38.321). The synchronous
//! [`MacScheduler`] owns every piece of per-cell state; [`GnbMac`] wraps it
//! behind a mutex so the PHY, the control plane and the telemetry agent can
//! reach it from separate tasks.

pub mod beam;
pub mod bler;
pub mod config;
pub mod harq;
pub mod list;
pub mod mcs;
pub mod ra;
pub mod registry;
pub mod scheduler;
pub mod ue;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use common::types::Rnti;
use interfaces::message_types::{SlotIndication, UplinkIndication};
use interfaces::northbound::{ControlAction, TelemetrySnapshot};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::LayerError;

pub use config::MacConfig;
pub use harq::{HarqState, ResourceAllocation};
pub use ra::RaState;
pub use scheduler::{DlGrant, DlGrantKind, MacNotification, MacScheduler, PucchGrant, RarGrant, SlotSchedule, UlGrant};

/// Bounded resource pools the scheduler can run out of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    DlHarq,
    UlHarq,
    RandomAccess,
    Rnti,
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Pool::DlHarq => "DL HARQ",
            Pool::UlHarq => "UL HARQ",
            Pool::RandomAccess => "RA procedure",
            Pool::Rnti => "C-RNTI",
        };
        f.write_str(name)
    }
}

/// MAC scheduler errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MacError {
    #[error("Index list is empty")]
    EmptyList,

    #[error("{0} pool exhausted")]
    PoolExhausted(Pool),

    #[error("UE registry full ({0} UEs)")]
    RegistryFull(usize),

    #[error("RNTI {0} already in use")]
    DuplicateRnti(Rnti),

    #[error("PRBs {rb_start}..{rb_end} already committed in period {period}")]
    ResourceConflict { period: usize, rb_start: u16, rb_end: u16 },

    #[error("PRB range ends at {rb_end}, beyond {num_prbs} PRBs")]
    OutOfBandwidth { rb_end: u16, num_prbs: u16 },

    #[error("Unknown UE {0}")]
    UnknownUe(Rnti),

    #[error("HARQ pid {pid} outside a pool of {num}")]
    InvalidHarqPid { pid: u8, num: usize },

    #[error("HARQ pid {pid} in state {state:?} cannot {action}")]
    InvalidHarqState { pid: u8, state: HarqState, action: &'static str },

    #[error("PRACH occasion s={symbol} t={slot} f={freq} ul_carrier={ul_carrier} out of range")]
    InvalidPrachOccasion { symbol: u8, slot: u8, freq: u8, ul_carrier: u8 },

    #[error("Unknown RA procedure {0}")]
    UnknownRaProcedure(usize),

    #[error("{event} not expected in RA state {state}")]
    UnexpectedRaEvent { state: RaState, event: &'static str },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// MAC-PHY interface driven once per slot
#[async_trait]
pub trait MacPhyInterface: Send + Sync {
    /// Run the scheduler for the indicated slot
    async fn slot_indication(&self, indication: SlotIndication) -> Result<SlotSchedule, LayerError>;

    /// Queue an uplink event for the next slot
    async fn deliver_uplink(&self, indication: UplinkIndication) -> Result<(), LayerError>;
}

/// Northbound telemetry and control
#[async_trait]
pub trait MacTelemetry: Send + Sync {
    async fn snapshot(&self) -> TelemetrySnapshot;

    async fn apply_action(&self, action: ControlAction) -> Result<(), LayerError>;
}

/// Shared handle to the cell scheduler
#[derive(Clone)]
pub struct GnbMac {
    scheduler: Arc<Mutex<MacScheduler>>,
    notifications: mpsc::UnboundedSender<MacNotification>,
}

impl GnbMac {
    /// Create the MAC and the receiver of its UE lifecycle notifications
    pub fn new(config: MacConfig) -> Result<(Self, mpsc::UnboundedReceiver<MacNotification>), LayerError> {
        info!(
            "Creating MAC: cell_id={}, scs={:?}, bandwidth={:?}, prbs={}",
            config.cell_id.0,
            config.scs,
            config.bandwidth,
            config.prbs()
        );
        let scheduler = MacScheduler::new(config)?;
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                scheduler: Arc::new(Mutex::new(scheduler)),
                notifications: tx,
            },
            rx,
        ))
    }

    /// Direct access to the scheduler, mostly for inspection
    pub fn scheduler(&self) -> Arc<Mutex<MacScheduler>> {
        Arc::clone(&self.scheduler)
    }

    fn forward(&self, notifications: Vec<MacNotification>) {
        for notification in notifications {
            if self.notifications.send(notification).is_err() {
                debug!("Notification receiver gone, dropping {:?}", notification);
            }
        }
    }

    /// Register a UE known to the control plane
    pub async fn add_ue(&self, rnti: Rnti, beam_index: u8) -> Result<u16, LayerError> {
        let mut scheduler = self.scheduler.lock().await;
        let uid = scheduler.add_ue(rnti, beam_index)?;
        let notifications = scheduler.take_notifications();
        drop(scheduler);
        self.forward(notifications);
        Ok(uid)
    }

    /// Tear down a UE, its HARQ state and any RA procedure it owns
    pub async fn remove_ue(&self, rnti: Rnti) -> Result<(), LayerError> {
        Ok(self.scheduler.lock().await.remove_ue(rnti)?)
    }

    /// Reserve dedicated preambles for a contention-free access by `rnti`
    pub async fn prepare_cfra(&self, rnti: Rnti, preambles: &[u8], beam_index: u8) -> Result<(), LayerError> {
        Ok(self.scheduler.lock().await.prepare_cfra(rnti, preambles, beam_index)?)
    }

    /// Hand the payload of a DL transport block to its HARQ process
    pub async fn attach_transport_block(&self, rnti: Rnti, harq_pid: u8, payload: Bytes) -> Result<(), LayerError> {
        Ok(self.scheduler.lock().await.attach_transport_block(rnti, harq_pid, payload)?)
    }

    /// Apply a new configuration between slots
    pub async fn reconfigure(&self, config: MacConfig) -> Result<(), LayerError> {
        Ok(self.scheduler.lock().await.reconfigure(config)?)
    }
}

#[async_trait]
impl MacPhyInterface for GnbMac {
    async fn slot_indication(&self, indication: SlotIndication) -> Result<SlotSchedule, LayerError> {
        let time = indication.time();
        let mut schedule = SlotSchedule::new(time);
        let mut scheduler = self.scheduler.lock().await;
        scheduler.run_slot(time, &mut schedule);
        let notifications = scheduler.take_notifications();
        drop(scheduler);
        self.forward(notifications);
        Ok(schedule)
    }

    async fn deliver_uplink(&self, indication: UplinkIndication) -> Result<(), LayerError> {
        self.scheduler.lock().await.deliver(indication);
        Ok(())
    }
}

#[async_trait]
impl MacTelemetry for GnbMac {
    async fn snapshot(&self) -> TelemetrySnapshot {
        self.scheduler.lock().await.snapshot()
    }

    async fn apply_action(&self, action: ControlAction) -> Result<(), LayerError> {
        action.validate()?;
        Ok(self.scheduler.lock().await.apply_action(action)?)
    }
}
