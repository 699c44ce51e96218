//! Built-in environments.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::Environment;
use crate::agent::action_value;
use crate::core::Int2;

/// Observation alternating between all-on and all-off.
///
/// The reward is `+1` when the designated action unit is above one half and
/// `-1` otherwise.
#[derive(Clone, Debug)]
pub struct OnOffTask {
    observation_size: Int2,
    action_size: Int2,
    target_unit: Int2,
    on: bool,
}

impl Default for OnOffTask {
    fn default() -> Self {
        Self::new(Int2::new(8, 8), Int2::new(2, 2), Int2::new(0, 0))
    }
}

impl OnOffTask {
    pub fn new(observation_size: Int2, action_size: Int2, target_unit: Int2) -> Self {
        Self {
            observation_size,
            action_size,
            target_unit,
            on: true,
        }
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

impl Environment for OnOffTask {
    fn observe(&self) -> Array2<f32> {
        let value = if self.on { 1.0 } else { 0.0 };
        Array2::from_elem(self.observation_size.dim(), value)
    }

    fn act(&mut self, action: &Array2<f32>) -> f32 {
        self.on = !self.on;
        if action_value(action, self.target_unit, Int2::new(1, 1)) > 0.5 {
            1.0
        } else {
            -1.0
        }
    }

    fn action_size(&self) -> Int2 {
        self.action_size
    }

    fn observation_size(&self) -> Int2 {
        self.observation_size
    }
}

pub const PONG_FIELD: i32 = 16;
const PADDLE_WIDTH: f32 = 4.0;
const PADDLE_SPEED: f32 = 1.0;
const BALL_SPEED: f32 = 0.5;

/// Headless pong on a 16x16 field.
///
/// The paddle sits on the bottom row. The action is a 2x1 surface: the
/// paddle moves right by the difference between the right and left units.
/// Returning the ball pays `+1`. Missing it pays `-1`, ends the episode and
/// serves a new ball from the top.
#[derive(Clone, Debug)]
pub struct Pong {
    ball: (f32, f32),
    velocity: (f32, f32),
    paddle: f32,
    missed: bool,
    rng: StdRng,
}

impl Pong {
    pub fn new(seed: u64) -> Self {
        let mut pong = Self {
            ball: (0.0, 0.0),
            velocity: (0.0, 0.0),
            paddle: PONG_FIELD as f32 / 2.0,
            missed: false,
            rng: StdRng::seed_from_u64(seed),
        };
        pong.serve();
        pong
    }

    fn serve(&mut self) {
        let field = PONG_FIELD as f32;
        self.ball = (self.rng.gen_range(0.0..field), 0.0);
        let vx = self.rng.gen_range(-BALL_SPEED..BALL_SPEED);
        self.velocity = (vx, BALL_SPEED);
    }

    /// Ball position in field coordinates.
    pub fn ball(&self) -> (f32, f32) {
        self.ball
    }

    /// Paddle center.
    pub fn paddle(&self) -> f32 {
        self.paddle
    }
}

impl Environment for Pong {
    fn observe(&self) -> Array2<f32> {
        let n = PONG_FIELD as usize;
        let mut obs = Array2::zeros((n, n));
        let bx = (self.ball.0 as usize).min(n - 1);
        let by = (self.ball.1.max(0.0) as usize).min(n - 1);
        obs[[bx, by]] = 1.0;
        let half = PADDLE_WIDTH / 2.0;
        for x in 0..n {
            let center = x as f32 + 0.5;
            if (center - self.paddle).abs() <= half {
                obs[[x, n - 1]] = 1.0;
            }
        }
        obs
    }

    fn act(&mut self, action: &Array2<f32>) -> f32 {
        let field = PONG_FIELD as f32;
        self.missed = false;
        let left = action_value(action, Int2::new(0, 0), Int2::new(1, 1));
        let right = action_value(action, Int2::new(1, 0), Int2::new(1, 1));
        self.paddle = (self.paddle + (right - left) * PADDLE_SPEED).clamp(0.0, field);

        let (mut x, mut y) = (self.ball.0 + self.velocity.0, self.ball.1 + self.velocity.1);
        if x < 0.0 {
            x = -x;
            self.velocity.0 = -self.velocity.0;
        } else if x >= field {
            x = 2.0 * field - x - f32::EPSILON * field;
            self.velocity.0 = -self.velocity.0;
        }
        if y < 0.0 {
            y = -y;
            self.velocity.1 = -self.velocity.1;
        }
        self.ball = (x.clamp(0.0, field - 0.001), y);

        if y >= field - 1.0 {
            if (x - self.paddle).abs() <= PADDLE_WIDTH / 2.0 + 0.5 {
                self.ball.1 = field - 1.0 - (y - (field - 1.0));
                self.velocity.1 = -self.velocity.1;
                1.0
            } else {
                self.missed = true;
                self.serve();
                -1.0
            }
        } else {
            0.0
        }
    }

    fn action_size(&self) -> Int2 {
        Int2::new(2, 1)
    }

    fn observation_size(&self) -> Int2 {
        Int2::new(PONG_FIELD, PONG_FIELD)
    }

    fn episode_ended(&self) -> bool {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_on_off_alternates_and_rewards_target_unit() {
        let mut task = OnOffTask::default();
        assert!(task.observe().iter().all(|&v| v == 1.0));
        let mut action = Array2::zeros((2, 2));
        assert_eq!(task.act(&action), -1.0);
        assert!(task.observe().iter().all(|&v| v == 0.0));
        action[[0, 0]] = 0.9;
        assert_eq!(task.act(&action), 1.0);
        assert!(task.is_on());
    }

    #[test]
    fn test_pong_observation_marks_ball_and_paddle() {
        let pong = Pong::new(1);
        let obs = pong.observe();
        assert_eq!(obs.dim(), (16, 16));
        let paddle_pixels = (0..16).filter(|&x| obs[[x, 15]] > 0.0).count();
        assert_eq!(paddle_pixels, 4);
        assert!(obs.sum() >= 4.0);
    }

    #[test]
    fn test_pong_stays_in_field_and_scores() {
        let mut pong = Pong::new(2);
        let idle = Array2::zeros((2, 1));
        let mut rewards = Vec::new();
        for _ in 0..400 {
            rewards.push(pong.act(&idle));
            let (x, y) = pong.ball();
            assert!((0.0..16.0).contains(&x));
            assert!((0.0..16.0).contains(&y));
        }
        assert!(rewards.iter().any(|&r| r != 0.0));
    }

    #[test]
    fn test_miss_ends_episode() {
        let mut pong = Pong::new(4);
        let idle = Array2::zeros((2, 1));
        let mut misses = 0;
        for _ in 0..400 {
            let reward = pong.act(&idle);
            assert_eq!(pong.episode_ended(), reward < 0.0);
            if pong.episode_ended() {
                misses += 1;
                assert_eq!(pong.ball().1, 0.0);
            }
        }
        assert!(misses > 0);
        assert!(!OnOffTask::default().episode_ended());
    }

    #[test]
    fn test_paddle_moves_right() {
        let mut pong = Pong::new(3);
        let start = pong.paddle();
        let mut right = Array2::zeros((2, 1));
        right[[1, 0]] = 1.0;
        pong.act(&right);
        assert!(pong.paddle() > start);
    }
}
