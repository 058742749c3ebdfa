use anyhow::Result;
use mbrl_core::{
    env::{Env, EnvironmentDescription, SnapShot, Space},
    rng::seeded,
};
use rand::Rng;
use std::f32::consts::PI;

const MAX_SPEED: f32 = 8.;
const MAX_TORQUE: f32 = 2.;
const DT: f32 = 0.05;
const G: f32 = 10.;
const M: f32 = 1.;
const L: f32 = 1.;
const HORIZON: usize = 200;

/// Classic torque limited pendulum swing-up. Observation is `[cos θ, sin θ, θ̇]`.
#[derive(Debug, Clone, Default)]
pub struct Pendulum {
    theta: f32,
    theta_dot: f32,
    steps: usize,
}

fn angle_normalize(x: f32) -> f32 {
    (x + PI).rem_euclid(2. * PI) - PI
}

fn cost(theta: f32, theta_dot: f32, torque: f32) -> f32 {
    angle_normalize(theta).powi(2) + 0.1 * theta_dot.powi(2) + 0.001 * torque.powi(2)
}

impl Pendulum {
    fn observation(&self) -> Vec<f32> {
        vec![self.theta.cos(), self.theta.sin(), self.theta_dot]
    }
}

impl Env for Pendulum {
    fn name(&self) -> &str {
        "pendulum"
    }

    fn reset(&mut self, seed: u64) -> Result<Vec<f32>> {
        let mut rng = seeded(seed);
        self.theta = rng.random_range(-PI..PI);
        self.theta_dot = rng.random_range(-1f32..1.);
        self.steps = 0;
        Ok(self.observation())
    }

    fn step(&mut self, action: &[f32]) -> Result<SnapShot> {
        let torque = action[0].clamp(-MAX_TORQUE, MAX_TORQUE);
        let reward = -cost(self.theta, self.theta_dot, torque);
        let accel = 3. * G / (2. * L) * self.theta.sin() + 3. / (M * L * L) * torque;
        self.theta_dot = (self.theta_dot + accel * DT).clamp(-MAX_SPEED, MAX_SPEED);
        self.theta += self.theta_dot * DT;
        self.steps += 1;
        Ok(SnapShot {
            state: self.observation(),
            reward,
            terminated: false,
            truncated: self.steps >= HORIZON,
        })
    }

    fn env_description(&self) -> EnvironmentDescription {
        EnvironmentDescription::new(
            Space::bounded(vec![-1., -1., -MAX_SPEED], vec![1., 1., MAX_SPEED]),
            Space::bounded(vec![-MAX_TORQUE], vec![MAX_TORQUE]),
        )
    }

    fn horizon(&self) -> usize {
        HORIZON
    }

    fn reward(&self, state: &[f32], action: &[f32], _next_state: &[f32]) -> Option<f32> {
        let theta = state[1].atan2(state[0]);
        let torque = action[0].clamp(-MAX_TORQUE, MAX_TORQUE);
        Some(-cost(theta, state[2], torque))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn analytic_reward_agrees_with_dynamics() -> Result<()> {
        let mut env = Pendulum::default();
        let mut state = env.reset(5)?;
        for torque in [0.5, -3., 1.2] {
            let snapshot = env.step(&[torque])?;
            let reward = env.reward(&state, &[torque], &snapshot.state).unwrap_or(f32::NAN);
            assert!((reward - snapshot.reward).abs() < 1e-4);
            assert!(snapshot.state[2].abs() <= MAX_SPEED);
            state = snapshot.state;
        }
        Ok(())
    }

    #[test]
    fn angles_are_wrapped() {
        assert!((angle_normalize(3. * PI / 2.) + PI / 2.).abs() < 1e-5);
        assert!((angle_normalize(0.3) - 0.3).abs() < 1e-6);
    }
}
