use anyhow::Result;
use log::info;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::file_source::FileSource;
use crate::ghost_source::GhostSource;
use crate::source::AudioSource;

/// A ghost source plus the file sources keeping time with it.
///
/// The ghost is the group's one authority on position and tempo; members
/// follow through the observer fan-out (transport, tempo, pitch, loop) and
/// render against the master clock for sample-accurate alignment. The
/// ghost's timeline always spans the longest member.
pub struct SyncGroup {
    ghost: Arc<GhostSource>,
    members: Mutex<Vec<Arc<FileSource>>>,
    sample_rate: u32,
}

impl SyncGroup {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ghost: Arc::new(GhostSource::new(config.sample_rate, config.channels)),
            members: Mutex::new(Vec::new()),
            sample_rate: config.sample_rate,
        }
    }

    pub fn ghost(&self) -> &Arc<GhostSource> {
        &self.ghost
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn members(&self) -> Vec<Arc<FileSource>> {
        self.members
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Group duration in seconds: the longest member.
    pub fn duration(&self) -> f64 {
        self.ghost.total_frames() as f64 / self.sample_rate as f64
    }

    /// Attach a source: it starts observing the ghost, renders against the
    /// master clock, and the ghost grows to cover it if needed.
    pub fn add(&self, source: &Arc<FileSource>) {
        source.observe_ghost(&self.ghost);
        source.attach_to_clock();
        if let Ok(mut members) = self.members.lock() {
            members.push(Arc::clone(source));
        }
        self.resize_ghost();
        info!(
            "Sync group now has {} members, {:.3}s",
            self.member_count(),
            self.duration()
        );
    }

    /// Detach a member, restoring its pre-attachment independence. The
    /// ghost shrinks if the longest member left.
    pub fn remove(&self, id: Uuid) -> Option<Arc<FileSource>> {
        let removed = {
            let mut members = self.members.lock().ok()?;
            let index = members.iter().position(|m| m.id() == id)?;
            Some(members.remove(index))
        };
        if let Some(source) = &removed {
            source.release_ghost();
            source.detach_from_clock();
            self.resize_ghost();
        }
        removed
    }

    fn resize_ghost(&self) {
        let longest = self
            .members
            .lock()
            .map(|members| {
                members
                    .iter()
                    .map(|m| (m.duration() * self.sample_rate as f64).round() as u64)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        self.ghost.resize_frames(longest);
    }

    /// Start the whole group; the ghost fans the transition out.
    pub fn play(&self) -> Result<()> {
        self.ghost.play()
    }

    pub fn pause(&self) {
        self.ghost.pause();
    }

    pub fn stop(&self) {
        self.ghost.stop();
    }

    pub fn seek(&self, seconds: f64) -> EngineResult<()> {
        self.ghost.seek(seconds)
    }

    pub fn set_tempo(&self, tempo: f32) {
        self.ghost.set_tempo(tempo);
    }

    pub fn set_pitch_semitones(&self, semitones: f32) {
        self.ghost.set_pitch_semitones(semitones);
    }

    pub fn set_looping(&self, looping: bool) {
        self.ghost.set_looping_all(looping);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SineDecoder;

    fn member(duration: f64, config: &EngineConfig) -> Arc<FileSource> {
        let decoder = SineDecoder::new(440.0, duration, config.sample_rate, config.channels);
        FileSource::new("member", Box::new(decoder), config).unwrap()
    }

    #[test]
    fn test_group_duration_is_longest_member() {
        let config = EngineConfig::default();
        let group = SyncGroup::new(&config);

        let short = member(5.0, &config);
        let medium = member(7.0, &config);
        let long = member(10.0, &config);
        group.add(&short);
        group.add(&medium);
        group.add(&long);

        assert_eq!(group.member_count(), 3);
        assert!((group.duration() - 10.0).abs() < 1e-9);
        assert_eq!(group.ghost().observer_count(), 3);
    }

    #[test]
    fn test_removing_longest_member_shrinks_ghost() {
        let config = EngineConfig::default();
        let group = SyncGroup::new(&config);

        let short = member(5.0, &config);
        let long = member(10.0, &config);
        group.add(&short);
        group.add(&long);

        let removed = group.remove(long.id()).unwrap();
        assert_eq!(removed.id(), long.id());
        assert!((group.duration() - 5.0).abs() < 1e-9);
        assert_eq!(group.ghost().observer_count(), 1);
    }

    #[test]
    fn test_tempo_cascades_to_members() {
        let config = EngineConfig::default();
        let group = SyncGroup::new(&config);

        let a = member(5.0, &config);
        let b = member(7.0, &config);
        group.add(&a);
        group.add(&b);

        group.set_tempo(1.5);
        assert_eq!(a.tempo(), 1.5);
        assert_eq!(b.tempo(), 1.5);
    }

    #[test]
    fn test_detached_member_ignores_ghost() {
        let config = EngineConfig::default();
        let group = SyncGroup::new(&config);

        let a = member(5.0, &config);
        group.add(&a);
        group.remove(a.id());

        group.set_tempo(2.0);
        assert_eq!(a.tempo(), 1.0);
        assert!(!crate::source::MasterClockSource::is_attached_to_clock(
            a.as_ref()
        ));
    }

    #[test]
    fn test_unknown_member_removal_is_none() {
        let config = EngineConfig::default();
        let group = SyncGroup::new(&config);
        assert!(group.remove(Uuid::new_v4()).is_none());
    }
}
