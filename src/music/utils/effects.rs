//! Equalizer and playback-rate state per session, applied to the node as
//! one filter update.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::SessionId;
use super::music_manager::{MusicError, MusicManager, MusicResult};
use super::node_client::{EqualizerBand, Filters, PlayerUpdate, Timescale};
use crate::music::audio_sources::Feature;
use crate::utils::database::{self, SettingsStore};

pub const BAND_COUNT: usize = 15;
pub const MIN_GAIN: f32 = -0.25;
pub const MAX_GAIN: f32 = 1.0;
pub const MIN_PLAYBACK_RATE: f64 = 0.1;
pub const MAX_PLAYBACK_RATE: f64 = 5.0;

/// A named equalizer configuration; bands left out mean gain 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EqualizerPreset {
    pub name: String,
    pub bands: BTreeMap<u8, f32>,
}

/// Gains for all fifteen bands
#[derive(Debug, Clone, PartialEq)]
pub struct Equalizer {
    pub name: String,
    gains: [f32; BAND_COUNT],
}

impl Default for Equalizer {
    fn default() -> Self {
        Self {
            name: "flat".to_string(),
            gains: [0.0; BAND_COUNT],
        }
    }
}

impl Equalizer {
    /// Builds an equalizer from a preset. Gains are clamped into range; an
    /// out-of-range band index rejects the whole preset.
    pub fn from_preset(preset: &EqualizerPreset) -> MusicResult<Self> {
        let mut gains = [0.0; BAND_COUNT];
        for (&band, &gain) in &preset.bands {
            let slot = gains.get_mut(usize::from(band)).ok_or_else(|| {
                MusicError::EffectApplyError(format!(
                    "band {} is out of range (0-{})",
                    band,
                    BAND_COUNT - 1
                ))
            })?;
            *slot = clamp_gain(gain);
        }
        Ok(Self {
            name: preset.name.clone(),
            gains,
        })
    }

    pub fn gains(&self) -> &[f32; BAND_COUNT] {
        &self.gains
    }

    pub fn gain(&self, band: u8) -> Option<f32> {
        self.gains.get(usize::from(band)).copied()
    }

    pub fn is_flat(&self) -> bool {
        self.gains.iter().all(|gain| *gain == 0.0)
    }

    /// The non-zero bands as a preset, `None` for a flat equalizer.
    pub fn to_preset(&self) -> Option<EqualizerPreset> {
        if self.is_flat() {
            return None;
        }
        let bands = self
            .gains
            .iter()
            .enumerate()
            .filter(|(_, gain)| **gain != 0.0)
            .map(|(band, gain)| (band as u8, *gain))
            .collect();
        Some(EqualizerPreset {
            name: self.name.clone(),
            bands,
        })
    }
}

fn clamp_gain(gain: f32) -> f32 {
    if gain.is_nan() {
        0.0
    } else {
        gain.clamp(MIN_GAIN, MAX_GAIN)
    }
}

/// Filter state of one session
#[derive(Debug, Clone, PartialEq)]
pub struct EffectsState {
    pub equalizer: Equalizer,
    pub playback_rate: f64,
}

impl Default for EffectsState {
    fn default() -> Self {
        Self {
            equalizer: Equalizer::default(),
            playback_rate: 1.0,
        }
    }
}

impl EffectsState {
    /// The full filter payload; every band is always sent so the node never
    /// keeps a stale gain.
    pub fn to_filters(&self) -> Filters {
        let equalizer = self
            .equalizer
            .gains
            .iter()
            .enumerate()
            .map(|(band, gain)| EqualizerBand {
                band: band as u8,
                gain: *gain,
            })
            .collect();
        let timescale = (self.playback_rate != 1.0).then(|| Timescale {
            speed: self.playback_rate,
            pitch: 1.0,
            rate: 1.0,
        });
        Filters {
            equalizer,
            timescale,
        }
    }
}

/// Applies effect changes to sessions through their node
pub struct EffectsEngine {
    manager: Arc<MusicManager>,
}

impl EffectsEngine {
    pub fn new(manager: Arc<MusicManager>) -> Self {
        Self { manager }
    }

    /// Builds the candidate state, sends it, and commits only once the node
    /// accepted it. Changes to one session are applied one at a time, so
    /// each builds on the last committed state.
    async fn apply<F>(&self, session_id: SessionId, change: F) -> MusicResult<EffectsState>
    where
        F: FnOnce(&EffectsState) -> MusicResult<EffectsState>,
    {
        let session = self.manager.session(session_id)?;
        let _commands = self.manager.command_lock(session_id).await;
        let candidate = {
            let guard = session.lock().await;
            guard.ensure_connected()?;
            change(&guard.effects)?
        };

        let node = self
            .manager
            .playback_node(&session, session_id, Feature::Filters)
            .await
            .map_err(|e| MusicError::EffectApplyError(e.to_string()))?;
        node.client()
            .update_player(session_id, &PlayerUpdate::filters(&candidate))
            .await
            .map_err(|e| {
                warn!(
                    "Node {} rejected filters for session {}: {}",
                    node.identifier, session_id, e
                );
                MusicError::EffectApplyError(e.to_string())
            })?;

        let mut guard = session.lock().await;
        // Re-anchor the clock so elapsed time at the old rate is kept.
        let position = guard.position_ms();
        guard.clock.sync(position);
        guard.effects = candidate.clone();
        debug!("Applied effects to session {}: {:?}", session_id, candidate);
        Ok(candidate)
    }

    pub async fn set_equalizer(
        &self,
        session_id: SessionId,
        preset: &EqualizerPreset,
    ) -> MusicResult<EffectsState> {
        let equalizer = Equalizer::from_preset(preset)?;
        info!(
            "Setting equalizer '{}' for session {}",
            preset.name, session_id
        );
        self.apply(session_id, move |current| {
            Ok(EffectsState {
                equalizer,
                ..current.clone()
            })
        })
        .await
    }

    pub async fn clear_equalizer(&self, session_id: SessionId) -> MusicResult<EffectsState> {
        info!("Clearing equalizer for session {}", session_id);
        self.apply(session_id, |current| {
            Ok(EffectsState {
                equalizer: Equalizer::default(),
                ..current.clone()
            })
        })
        .await
    }

    /// Moves one band's gain by `delta`, clamped into range.
    pub async fn adjust_band(
        &self,
        session_id: SessionId,
        band: u8,
        delta: f32,
    ) -> MusicResult<EffectsState> {
        self.apply(session_id, move |current| {
            let mut next = current.clone();
            let slot = next
                .equalizer
                .gains
                .get_mut(usize::from(band))
                .ok_or_else(|| {
                    MusicError::EffectApplyError(format!("band {} is out of range", band))
                })?;
            *slot = clamp_gain(*slot + delta);
            next.equalizer.name = "custom".to_string();
            Ok(next)
        })
        .await
    }

    /// Changes the playback speed (timescale filter).
    pub async fn set_playback_rate(
        &self,
        session_id: SessionId,
        rate: f64,
    ) -> MusicResult<EffectsState> {
        if !(MIN_PLAYBACK_RATE..=MAX_PLAYBACK_RATE).contains(&rate) {
            return Err(MusicError::EffectApplyError(format!(
                "playback rate must be between {} and {}",
                MIN_PLAYBACK_RATE, MAX_PLAYBACK_RATE
            )));
        }
        info!("Setting playback rate {} for session {}", rate, session_id);
        self.apply(session_id, move |current| {
            Ok(EffectsState {
                playback_rate: rate,
                ..current.clone()
            })
        })
        .await
    }

    /// The equalizer as persisted: `None` when flat.
    pub async fn persist(&self, session_id: SessionId) -> MusicResult<Option<EqualizerPreset>> {
        Ok(self.manager.effects(session_id).await?.equalizer.to_preset())
    }

    /// Re-applies a persisted equalizer; `None` resets it.
    pub async fn restore(
        &self,
        session_id: SessionId,
        preset: Option<&EqualizerPreset>,
    ) -> MusicResult<EffectsState> {
        match preset {
            Some(preset) => self.set_equalizer(session_id, preset).await,
            None => self.clear_equalizer(session_id).await,
        }
    }

    /// Stores the session's equalizer as its "last used" preset.
    pub async fn save(
        &self,
        session_id: SessionId,
        store: &dyn SettingsStore,
    ) -> MusicResult<()> {
        let preset = self.persist(session_id).await?;
        let mut settings = database::load_session_settings(store, session_id).await?;
        settings.equalizer_preset = preset;
        database::save_session_settings(store, session_id, &settings).await
    }

    /// Restores the session's "last used" preset from the store.
    pub async fn load(
        &self,
        session_id: SessionId,
        store: &dyn SettingsStore,
    ) -> MusicResult<EffectsState> {
        let settings = database::load_session_settings(store, session_id).await?;
        self.restore(session_id, settings.equalizer_preset.as_ref())
            .await
    }
}
