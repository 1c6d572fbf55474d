//! Client-side prediction and server reconciliation.
//!
//! Every locally applied input gets a sequence number and the resulting
//! movement state is stored with it. When the server acknowledges a sequence,
//! the stored prediction for that sequence is compared with the authoritative
//! position: large errors reset and replay every newer input, small errors are
//! blended away.

use crate::config::PredictionConfig;
use crate::protocol::InputFrame;
use glam::Vec3;
use netsync_core::{NetComponent, NetId, PlayerInput};
use std::collections::BTreeMap;
use tracing::debug;

/// Inputs below this magnitude count as "no input" when diffing.
const INPUT_EPSILON: f32 = 1e-3;

/// Kinematic state produced by the movement model.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MovementState {
    /// Position.
    pub position: Vec3,
    /// Velocity.
    pub velocity: Vec3,
    /// Standing on the ground.
    pub grounded: bool,
}

impl MovementState {
    /// Resting state at `position`.
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            velocity: Vec3::ZERO,
            grounded: true,
        }
    }
}

/// Deterministic movement function shared by client and server.
pub trait MovementModel {
    /// Advance `state` by one input over `dt` seconds.
    fn step(&self, state: &MovementState, input: &PlayerInput, dt: f32) -> MovementState;
}

/// Walk, sprint and jump over a flat ground plane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KinematicMovement {
    /// Walking speed in m/s.
    pub walk_speed: f32,
    /// Speed multiplier while sprinting.
    pub sprint_multiplier: f32,
    /// Downward acceleration in m/s².
    pub gravity: f32,
    /// Vertical take-off speed of a jump.
    pub jump_speed: f32,
    /// Height of the ground plane.
    pub ground_height: f32,
}

impl Default for KinematicMovement {
    fn default() -> Self {
        Self {
            walk_speed: 4.3,
            sprint_multiplier: 1.3,
            gravity: 20.0,
            jump_speed: 7.0,
            ground_height: 0.0,
        }
    }
}

impl MovementModel for KinematicMovement {
    fn step(&self, state: &MovementState, input: &PlayerInput, dt: f32) -> MovementState {
        let (sin, cos) = input.yaw.sin_cos();
        let forward = Vec3::new(-sin, 0.0, -cos);
        let right = Vec3::new(cos, 0.0, -sin);
        let wish = (forward * input.forward.clamp(-1.0, 1.0)
            + right * input.strafe.clamp(-1.0, 1.0))
        .clamp_length_max(1.0);
        let speed = if input.sprint {
            self.walk_speed * self.sprint_multiplier
        } else {
            self.walk_speed
        };

        let mut velocity = wish * speed;
        let mut grounded = state.grounded;
        velocity.y = if grounded && input.jump {
            grounded = false;
            self.jump_speed
        } else if grounded {
            0.0
        } else {
            state.velocity.y - self.gravity * dt
        };

        let mut position = state.position + velocity * dt;
        if position.y <= self.ground_height && velocity.y <= 0.0 {
            position.y = self.ground_height;
            velocity.y = 0.0;
            grounded = true;
        }
        MovementState {
            position,
            velocity,
            grounded,
        }
    }
}

/// One locally applied input and the state it produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PredictedFrame {
    /// Input sequence.
    pub seq: u32,
    /// Input that was applied.
    pub input: PlayerInput,
    /// Step length in seconds.
    pub dt: f32,
    /// State after applying the input.
    pub state: MovementState,
}

impl PredictedFrame {
    /// Wire form of the input.
    pub fn to_input_frame(&self) -> InputFrame {
        InputFrame {
            seq: self.seq,
            dt: self.dt,
            input: self.input.to_value(),
        }
    }
}

/// Authoritative state waiting for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerState {
    /// Authoritative position.
    pub position: Vec3,
    /// Authoritative velocity, if sent.
    pub velocity: Option<Vec3>,
    /// Highest input the server applied.
    pub ack_seq: Option<u32>,
}

/// Prediction bookkeeping of one entity.
#[derive(Debug, Clone, Default)]
pub struct PredictionState {
    current_sequence: u32,
    predictions: BTreeMap<u32, PredictedFrame>,
    last_acked_sequence: u32,
    acked_state: MovementState,
    server_state: Option<ServerState>,
    current: MovementState,
    last_sent: Option<(PlayerInput, f64)>,
}

impl PredictionState {
    /// Start predicting from `initial`.
    pub fn new(initial: MovementState) -> Self {
        Self {
            acked_state: initial,
            current: initial,
            ..Self::default()
        }
    }

    /// Sequence of the latest applied input.
    pub fn current_sequence(&self) -> u32 {
        self.current_sequence
    }

    /// Highest sequence the server confirmed.
    pub fn last_acked_sequence(&self) -> u32 {
        self.last_acked_sequence
    }

    /// Predicted state now.
    pub fn current(&self) -> MovementState {
        self.current
    }

    /// Stored prediction for `seq`.
    pub fn prediction(&self, seq: u32) -> Option<&PredictedFrame> {
        self.predictions.get(&seq)
    }

    /// Stored predictions in sequence order.
    pub fn predictions(&self) -> impl Iterator<Item = &PredictedFrame> {
        self.predictions.values()
    }

    /// Authoritative state not yet reconciled.
    pub fn server_state(&self) -> Option<&ServerState> {
        self.server_state.as_ref()
    }
}

/// Outcome of one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reconciliation {
    /// Prediction agreed with the server.
    Match {
        /// Acknowledged sequence.
        ack_seq: u32,
    },
    /// Small error, blended toward the server.
    Blended {
        /// Acknowledged sequence.
        ack_seq: u32,
        /// Position error in meters.
        error: f32,
    },
    /// Large error, reset and replayed.
    Snapped {
        /// Acknowledged sequence.
        ack_seq: u32,
        /// Position error in meters.
        error: f32,
        /// Inputs replayed on top of the server state.
        replayed: usize,
    },
}

/// Metrics for tracking prediction accuracy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionMetrics {
    /// Total number of predictions made.
    pub total_predictions: u64,

    /// Total number of reconciliations performed.
    pub total_reconciliations: u64,

    /// Reconciliations that snapped and replayed.
    pub total_snaps: u64,

    /// Reconciliations that blended.
    pub total_blends: u64,

    /// Inputs re-simulated during replays.
    pub total_replayed_inputs: u64,

    /// Average error of corrected predictions (meters).
    pub avg_error_distance: f32,

    /// Maximum error seen (meters).
    pub max_error_distance: f32,
}

/// Client-side predictor with rollback and replay.
pub struct ClientPredictor<M = KinematicMovement> {
    model: M,
    config: PredictionConfig,
    entities: BTreeMap<NetId, PredictionState>,
    metrics: PredictionMetrics,
}

impl ClientPredictor<KinematicMovement> {
    /// Predictor using the default movement model.
    pub fn new(config: PredictionConfig) -> Self {
        Self::with_model(KinematicMovement::default(), config)
    }
}

impl<M: MovementModel> ClientPredictor<M> {
    /// Predictor using a custom movement model.
    pub fn with_model(model: M, config: PredictionConfig) -> Self {
        Self {
            model,
            config,
            entities: BTreeMap::new(),
            metrics: PredictionMetrics::default(),
        }
    }

    /// Movement model.
    pub fn model(&self) -> &M {
        &self.model
    }

    /// Begin predicting `net_id` from `initial`. Existing state is kept.
    pub fn track(&mut self, net_id: NetId, initial: MovementState) {
        self.entities
            .entry(net_id)
            .or_insert_with(|| PredictionState::new(initial));
    }

    /// Drop all prediction state of `net_id`.
    pub fn remove(&mut self, net_id: NetId) -> Option<PredictionState> {
        self.entities.remove(&net_id)
    }

    /// Returns true if `net_id` is predicted.
    pub fn is_tracked(&self, net_id: NetId) -> bool {
        self.entities.contains_key(&net_id)
    }

    /// Prediction state of `net_id`.
    pub fn state(&self, net_id: NetId) -> Option<&PredictionState> {
        self.entities.get(&net_id)
    }

    /// Get current prediction metrics.
    pub fn metrics(&self) -> &PredictionMetrics {
        &self.metrics
    }

    /// Apply a local input, store the result under a new sequence and
    /// return both.
    pub fn predict(&mut self, net_id: NetId, input: PlayerInput, dt: f32) -> Option<PredictedFrame> {
        let entity = self.entities.get_mut(&net_id)?;
        let state = self.model.step(&entity.current, &input, dt);
        entity.current_sequence = entity.current_sequence.wrapping_add(1);
        let frame = PredictedFrame {
            seq: entity.current_sequence,
            input,
            dt,
            state,
        };
        entity.predictions.insert(frame.seq, frame);
        entity.current = state;
        while entity.predictions.len() > self.config.max_history.max(1) {
            entity.predictions.pop_first();
        }
        self.metrics.total_predictions += 1;
        Some(frame)
    }

    /// Whether an input is worth sending: movement-relevant fields changed
    /// since the last send, or the resend interval elapsed.
    pub fn should_send_input(&self, net_id: NetId, input: &PlayerInput, now: f64) -> bool {
        let Some(entity) = self.entities.get(&net_id) else {
            return false;
        };
        match &entity.last_sent {
            None => true,
            Some((last, sent_at)) => {
                movement_changed(last, input) || now - sent_at >= self.config.input_resend_interval
            }
        }
    }

    /// Record that `input` went out at `now`.
    pub fn mark_input_sent(&mut self, net_id: NetId, input: PlayerInput, now: f64) {
        if let Some(entity) = self.entities.get_mut(&net_id) {
            entity.last_sent = Some((input, now));
        }
    }

    /// Unacknowledged inputs, newest `max` of them, oldest first.
    pub fn unacked_inputs(&self, net_id: NetId, max: usize) -> Vec<InputFrame> {
        let Some(entity) = self.entities.get(&net_id) else {
            return Vec::new();
        };
        let frames: Vec<InputFrame> = entity
            .predictions
            .range(entity.last_acked_sequence.saturating_add(1)..)
            .map(|(_, frame)| frame.to_input_frame())
            .collect();
        let skip = frames.len().saturating_sub(max);
        frames.into_iter().skip(skip).collect()
    }

    /// Store authoritative state for the next [`ClientPredictor::reconcile`].
    pub fn receive_server_state(
        &mut self,
        net_id: NetId,
        position: Vec3,
        velocity: Option<Vec3>,
        ack_seq: Option<u32>,
    ) {
        if let Some(entity) = self.entities.get_mut(&net_id) {
            entity.server_state = Some(ServerState {
                position,
                velocity,
                ack_seq,
            });
        }
    }

    /// Reconcile pending authoritative state of `net_id`, if any.
    pub fn reconcile(&mut self, net_id: NetId) -> Option<Reconciliation> {
        let entity = self.entities.get_mut(&net_id)?;
        let server = entity.server_state.take()?;
        let ack = server.ack_seq.unwrap_or(entity.last_acked_sequence);
        if ack < entity.last_acked_sequence {
            debug!(%net_id, ack, last = entity.last_acked_sequence, "ignoring stale server state");
            return None;
        }

        let predicted = match entity.predictions.get(&ack) {
            Some(frame) => frame.state,
            None if ack == entity.last_acked_sequence => entity.acked_state,
            None => entity.current,
        };
        let error = predicted.position.distance(server.position);

        let outcome = if error > self.config.snap_threshold {
            let corrected = MovementState {
                position: server.position,
                velocity: server.velocity.unwrap_or(predicted.velocity),
                grounded: predicted.grounded,
            };
            let mut state = corrected;
            let mut replayed = 0usize;
            for frame in entity
                .predictions
                .range_mut(ack.saturating_add(1)..)
                .map(|(_, frame)| frame)
            {
                state = self.model.step(&state, &frame.input, frame.dt);
                frame.state = state;
                replayed += 1;
            }
            entity.current = state;
            entity.acked_state = corrected;
            self.metrics.total_snaps += 1;
            self.metrics.total_replayed_inputs += replayed as u64;
            debug!(%net_id, ack, error, replayed, "prediction snapped to server state");
            Reconciliation::Snapped {
                ack_seq: ack,
                error,
                replayed,
            }
        } else if error > self.config.error_epsilon {
            let offset = (server.position - predicted.position) * self.config.blend_factor;
            for frame in entity
                .predictions
                .range_mut(ack.saturating_add(1)..)
                .map(|(_, frame)| frame)
            {
                frame.state.position += offset;
            }
            entity.current.position += offset;
            entity.acked_state = MovementState {
                position: predicted.position + offset,
                ..predicted
            };
            self.metrics.total_blends += 1;
            Reconciliation::Blended {
                ack_seq: ack,
                error,
            }
        } else {
            entity.acked_state = predicted;
            Reconciliation::Match { ack_seq: ack }
        };

        if !matches!(outcome, Reconciliation::Match { .. }) {
            let corrections = self.metrics.total_snaps + self.metrics.total_blends;
            self.metrics.avg_error_distance = (self.metrics.avg_error_distance
                * (corrections - 1) as f32
                + error)
                / corrections as f32;
            self.metrics.max_error_distance = self.metrics.max_error_distance.max(error);
        }
        self.metrics.total_reconciliations += 1;

        entity.predictions.retain(|seq, _| *seq > ack);
        entity.last_acked_sequence = ack;
        Some(outcome)
    }
}

fn movement_changed(a: &PlayerInput, b: &PlayerInput) -> bool {
    (a.forward - b.forward).abs() > INPUT_EPSILON
        || (a.strafe - b.strafe).abs() > INPUT_EPSILON
        || (a.yaw - b.yaw).abs() > INPUT_EPSILON
        || a.jump != b.jump
        || a.sprint != b.sprint
}

#[cfg(test)]
mod tests {
    use super::*;

    const DT: f32 = 1.0 / 60.0;

    fn walk(forward: f32) -> PlayerInput {
        PlayerInput {
            forward,
            ..PlayerInput::idle()
        }
    }

    fn predictor() -> (ClientPredictor, NetId) {
        let mut predictor = ClientPredictor::new(PredictionConfig::default());
        let id = NetId(10001);
        predictor.track(id, MovementState::at(Vec3::ZERO));
        (predictor, id)
    }

    #[test]
    fn test_kinematic_walk_is_deterministic() {
        let model = KinematicMovement::default();
        let start = MovementState::at(Vec3::ZERO);
        let a = model.step(&start, &walk(1.0), DT);
        let b = model.step(&start, &walk(1.0), DT);
        assert_eq!(a, b);
        assert!(a.position.z < 0.0);
        assert!(a.grounded);
    }

    #[test]
    fn test_jump_leaves_ground_and_lands() {
        let model = KinematicMovement::default();
        let mut state = MovementState::at(Vec3::ZERO);
        state = model.step(
            &state,
            &PlayerInput {
                jump: true,
                ..PlayerInput::idle()
            },
            DT,
        );
        assert!(!state.grounded);
        assert!(state.position.y > 0.0);
        for _ in 0..120 {
            state = model.step(&state, &PlayerInput::idle(), DT);
        }
        assert!(state.grounded);
        assert_eq!(state.position.y, 0.0);
    }

    #[test]
    fn test_predict_assigns_increasing_sequences() {
        let (mut predictor, id) = predictor();
        let seqs: Vec<u32> = (0..3)
            .filter_map(|_| predictor.predict(id, walk(1.0), DT))
            .map(|f| f.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(predictor.metrics().total_predictions, 3);
    }

    #[test]
    fn test_matching_ack_prunes_history() {
        let (mut predictor, id) = predictor();
        for _ in 0..5 {
            predictor.predict(id, walk(1.0), DT);
        }
        let at3 = predictor.state(id).and_then(|s| s.prediction(3)).map(|f| f.state);
        let at3 = at3.expect("stored");
        predictor.receive_server_state(id, at3.position, None, Some(3));

        assert_eq!(
            predictor.reconcile(id),
            Some(Reconciliation::Match { ack_seq: 3 })
        );
        let state = predictor.state(id).expect("tracked");
        assert_eq!(state.last_acked_sequence(), 3);
        let remaining: Vec<u32> = state.predictions().map(|f| f.seq).collect();
        assert_eq!(remaining, vec![4, 5]);
    }

    #[test]
    fn test_small_error_blends() {
        let (mut predictor, id) = predictor();
        for _ in 0..2 {
            predictor.predict(id, walk(1.0), DT);
        }
        let before = predictor.state(id).expect("tracked").current();
        let at1 = predictor.state(id).and_then(|s| s.prediction(1)).expect("stored").state;
        predictor.receive_server_state(id, at1.position + Vec3::X, None, Some(1));

        let outcome = predictor.reconcile(id);
        assert!(matches!(outcome, Some(Reconciliation::Blended { ack_seq: 1, .. })));
        let after = predictor.state(id).expect("tracked").current();
        assert!((after.position.x - before.position.x - 0.2).abs() < 1e-5);
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let (mut predictor, id) = predictor();
        for _ in 0..4 {
            predictor.predict(id, walk(1.0), DT);
        }
        let at3 = predictor.state(id).and_then(|s| s.prediction(3)).expect("stored").state;
        predictor.receive_server_state(id, at3.position, None, Some(3));
        predictor.reconcile(id);

        predictor.receive_server_state(id, Vec3::splat(50.0), None, Some(2));
        assert_eq!(predictor.reconcile(id), None);
        assert_eq!(predictor.state(id).expect("tracked").last_acked_sequence(), 3);
    }

    #[test]
    fn test_should_send_input_only_on_change_or_interval() {
        let (mut predictor, id) = predictor();
        assert!(predictor.should_send_input(id, &walk(1.0), 0.0));
        predictor.mark_input_sent(id, walk(1.0), 0.0);

        assert!(!predictor.should_send_input(id, &walk(1.0), 0.05));
        assert!(predictor.should_send_input(id, &walk(0.5), 0.05));
        assert!(predictor.should_send_input(id, &walk(1.0), 0.2));
    }

    #[test]
    fn test_unacked_inputs_are_capped() {
        let (mut predictor, id) = predictor();
        for _ in 0..6 {
            predictor.predict(id, walk(1.0), DT);
        }
        let at2 = predictor.state(id).and_then(|s| s.prediction(2)).expect("stored").state;
        predictor.receive_server_state(id, at2.position, None, Some(2));
        predictor.reconcile(id);

        let seqs: Vec<u32> = predictor.unacked_inputs(id, 3).iter().map(|f| f.seq).collect();
        assert_eq!(seqs, vec![4, 5, 6]);
    }

    #[test]
    fn test_history_is_bounded() {
        let config = PredictionConfig {
            max_history: 4,
            ..PredictionConfig::default()
        };
        let mut predictor = ClientPredictor::new(config);
        let id = NetId(1);
        predictor.track(id, MovementState::default());
        for _ in 0..10 {
            predictor.predict(id, walk(1.0), DT);
        }
        let seqs: Vec<u32> = predictor
            .state(id)
            .expect("tracked")
            .predictions()
            .map(|f| f.seq)
            .collect();
        assert_eq!(seqs, vec![7, 8, 9, 10]);
    }
}
