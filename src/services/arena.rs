//! Server-side arena rules: food, movement plausibility and kill validation.
//! Rendering and physics stay on the client; the server only checks claims.

use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

use crate::{
    constants::{
        ARENA_SPAWN_MARGIN, EAT_RADIUS, FOOD_SPAWN_PER_TICK, FOOD_TARGET, INITIAL_SEGMENTS,
        KILL_RADIUS, MAX_DROPPED_FOOD, MAX_SPEED_PER_SEC, MOVE_TOLERANCE, SEGMENT_SPACING,
    },
    models::{Food, Point},
};

const FOOD_COLORS: [u32; 6] = [0xff4d4d, 0xffd24d, 0x4dff88, 0x4dc3ff, 0xb84dff, 0xff4dc3];

pub struct Arena {
    width: f64,
    height: f64,
    food: HashMap<String, Food>,
    next_food_id: u64,
}

impl Arena {
    pub fn new(width: f64, height: f64) -> Self {
        Self {
            width,
            height,
            food: HashMap::new(),
            next_food_id: 0,
        }
    }

    pub fn contains(&self, point: &Point) -> bool {
        (0.0..=self.width).contains(&point.x) && (0.0..=self.height).contains(&point.y)
    }

    pub fn spawn_point<R: Rng>(&self, rng: &mut R) -> Point {
        let margin_x = ARENA_SPAWN_MARGIN.min(self.width / 4.0);
        let margin_y = ARENA_SPAWN_MARGIN.min(self.height / 4.0);
        Point::new(
            rng.random_range(margin_x..self.width - margin_x),
            rng.random_range(margin_y..self.height - margin_y),
        )
    }

    fn place_food<R: Rng>(&mut self, rng: &mut R, at: Point, size: f64) -> Food {
        self.next_food_id += 1;
        let food = Food {
            id: format!("f{}", self.next_food_id),
            x: at.x.clamp(0.0, self.width),
            y: at.y.clamp(0.0, self.height),
            color: FOOD_COLORS[rng.random_range(0..FOOD_COLORS.len())],
            size,
        };
        self.food.insert(food.id.clone(), food.clone());
        food
    }

    /// Tops the arena up towards the target density, a few items per tick.
    pub fn replenish<R: Rng>(&mut self, rng: &mut R) -> Vec<Food> {
        let missing = FOOD_TARGET.saturating_sub(self.food.len());
        (0..missing.min(FOOD_SPAWN_PER_TICK))
            .map(|_| {
                let at = Point::new(
                    rng.random_range(0.0..self.width),
                    rng.random_range(0.0..self.height),
                );
                let size = rng.random_range(4.0..8.0);
                self.place_food(rng, at, size)
            })
            .collect()
    }

    /// Removes every food item within reach of `head` and returns their ids.
    pub fn eat_near(&mut self, head: &Point) -> Vec<String> {
        let eaten: Vec<String> = self
            .food
            .values()
            .filter(|food| head.distance(&Point::new(food.x, food.y)) <= EAT_RADIUS)
            .map(|food| food.id.clone())
            .collect();
        for id in &eaten {
            self.food.remove(id);
        }
        eaten
    }

    /// Scatters food along a dead snake's body.
    pub fn drop_remains<R: Rng>(&mut self, rng: &mut R, body: &[Point]) -> Vec<Food> {
        if body.is_empty() {
            return Vec::new();
        }
        let step = (body.len() / MAX_DROPPED_FOOD).max(1);
        body.iter()
            .step_by(step)
            .take(MAX_DROPPED_FOOD)
            .map(|segment| self.place_food(rng, *segment, 10.0))
            .collect()
    }

    pub fn food(&self) -> Vec<Food> {
        self.food.values().cloned().collect()
    }

    pub fn food_count(&self) -> usize {
        self.food.len()
    }
}

/// A body trailing straight back from `head` opposite to `angle`.
pub fn initial_body(head: Point, angle: f64) -> Vec<Point> {
    (0..INITIAL_SEGMENTS)
        .map(|i| {
            let offset = i as f64 * SEGMENT_SPACING;
            Point::new(head.x - angle.cos() * offset, head.y - angle.sin() * offset)
        })
        .collect()
}

/// Moves the server-side trail to a new head position.
///
/// `body[0]` is the head and the rest are segments laid down every
/// `SEGMENT_SPACING` along the path the head actually took, so the body a
/// kill is checked against is always connected.
pub fn advance_trail(body: &mut Vec<Point>, head: Point, length: usize) {
    let anchor = match body.get(1).or(body.first()) {
        Some(point) => *point,
        None => head,
    };
    let distance = anchor.distance(&head);
    let steps = ((distance / SEGMENT_SPACING).ceil() as usize).saturating_sub(1);
    let length = length.max(1);

    let mut trail = Vec::with_capacity(length);
    trail.push(head);
    for step in (steps.saturating_sub(length) + 1..=steps).rev() {
        let t = step as f64 * SEGMENT_SPACING / distance;
        trail.push(Point::new(
            anchor.x + (head.x - anchor.x) * t,
            anchor.y + (head.y - anchor.y) * t,
        ));
    }
    let committed = if body.len() > 1 { 1 } else { 0 };
    trail.extend(body.iter().skip(committed).copied());
    trail.truncate(length);
    *body = trail;
}

/// The head may not travel further than the boost speed allows (with tolerance).
pub fn move_is_plausible(previous: &Point, next: &Point, elapsed: Duration) -> bool {
    let allowed = MAX_SPEED_PER_SEC * elapsed.as_secs_f64().max(0.05) * MOVE_TOLERANCE;
    previous.distance(next) <= allowed
}

/// The victim's head must touch one of the killer's segments.
pub fn kill_is_plausible(killer_body: &[Point], victim_head: &Point) -> bool {
    killer_body
        .iter()
        .any(|segment| segment.distance(victim_head) <= KILL_RADIUS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn replenish_is_rate_limited_and_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut arena = Arena::new(1000.0, 1000.0);
        let spawned = arena.replenish(&mut rng);
        assert_eq!(spawned.len(), FOOD_SPAWN_PER_TICK);
        for _ in 0..100 {
            arena.replenish(&mut rng);
        }
        assert_eq!(arena.food_count(), FOOD_TARGET);
        assert!(arena.food().iter().all(|f| arena.contains(&Point::new(f.x, f.y))));
    }

    #[test]
    fn eating_removes_nearby_food_only() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut arena = Arena::new(1000.0, 1000.0);
        let near = arena.place_food(&mut rng, Point::new(100.0, 100.0), 5.0);
        arena.place_food(&mut rng, Point::new(500.0, 500.0), 5.0);
        assert_eq!(arena.eat_near(&Point::new(110.0, 100.0)), vec![near.id]);
        assert_eq!(arena.food_count(), 1);
    }

    #[test]
    fn remains_are_capped() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut arena = Arena::new(1000.0, 1000.0);
        let body: Vec<Point> = (0..100).map(|i| Point::new(i as f64, 10.0)).collect();
        assert_eq!(arena.drop_remains(&mut rng, &body).len(), MAX_DROPPED_FOOD);
    }

    #[test]
    fn speed_limit_rejects_teleports() {
        let from = Point::new(0.0, 0.0);
        assert!(move_is_plausible(&from, &Point::new(50.0, 0.0), Duration::from_millis(100)));
        assert!(!move_is_plausible(&from, &Point::new(500.0, 0.0), Duration::from_millis(100)));
    }

    #[test]
    fn trail_follows_the_head_without_gaps() {
        let mut body = initial_body(Point::new(200.0, 200.0), 0.0);
        advance_trail(&mut body, Point::new(236.0, 200.0), INITIAL_SEGMENTS + 3);

        assert_eq!(body[0], Point::new(236.0, 200.0));
        assert_eq!(body.len(), INITIAL_SEGMENTS + 3);
        for pair in body.windows(2) {
            assert!(pair[0].distance(&pair[1]) <= SEGMENT_SPACING + 1e-9);
        }

        // Standing still only moves the head marker.
        let before = body.clone();
        advance_trail(&mut body, Point::new(236.0, 200.0), INITIAL_SEGMENTS + 3);
        assert_eq!(body, before);
    }

    #[test]
    fn kill_needs_contact() {
        let body = initial_body(Point::new(200.0, 200.0), 0.0);
        assert_eq!(body.len(), INITIAL_SEGMENTS);
        assert!(kill_is_plausible(&body, &Point::new(180.0, 210.0)));
        assert!(!kill_is_plausible(&body, &Point::new(400.0, 400.0)));
    }
}
