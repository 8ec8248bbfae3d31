//! Shot boundary transitions.
//!
//! A transition never changes the timeline length. A fade dims the tail of
//! the outgoing shot and the head of the incoming one through black; a
//! dissolve blends the incoming head with the outgoing shot's last frame.

use image::RgbImage;

use crate::recipe::{Recipe, Transition};

/// Resolved transition into one shot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Boundary {
    Cut,
    Fade { window: f64 },
    Dissolve { window: f64 },
}

impl Boundary {
    pub fn window(&self) -> f64 {
        match self {
            Boundary::Cut => 0.0,
            Boundary::Fade { window } | Boundary::Dissolve { window } => *window,
        }
    }
}

/// `Auto` becomes a cut into the first shot and a fade everywhere else.
pub fn resolve_kind(transition: Transition, index: usize) -> Transition {
    match transition {
        Transition::Auto if index == 0 => Transition::Cut,
        Transition::Auto => Transition::Fade,
        other => other,
    }
}

/// Transition length: `fraction` of the incoming shot, clamped to half the
/// shorter of the two adjacent shots.
pub fn transition_window(fraction: f64, previous: f64, incoming: f64) -> f64 {
    let wanted = fraction.max(0.0) * incoming.max(0.0);
    wanted.min(0.5 * previous.min(incoming).max(0.0))
}

/// One boundary per shot; entry `i` is the transition into shot `i`.
pub fn plan_boundaries(recipe: &Recipe, default_fraction: f64) -> Vec<Boundary> {
    recipe
        .timeline
        .iter()
        .enumerate()
        .map(|(i, shot)| {
            if i == 0 {
                return Boundary::Cut;
            }
            let fraction = shot.transition_fraction.unwrap_or(default_fraction);
            let window = transition_window(
                fraction,
                recipe.timeline[i - 1].duration(),
                shot.duration(),
            );
            if window <= 0.0 {
                return Boundary::Cut;
            }
            match resolve_kind(shot.transition_in, i) {
                Transition::Fade => Boundary::Fade { window },
                Transition::Dissolve => Boundary::Dissolve { window },
                _ => Boundary::Cut,
            }
        })
        .collect()
}

/// Brightness multiplier at `time` into a shot of `duration`, given the
/// boundaries into and out of it.
pub fn fade_factor(time: f64, duration: f64, incoming: Boundary, outgoing: Option<Boundary>) -> f32 {
    let mut factor = 1.0f64;
    if let Boundary::Fade { window } = incoming {
        let half = window / 2.0;
        if half > 0.0 && time < half {
            factor = factor.min(time / half);
        }
    }
    if let Some(Boundary::Fade { window }) = outgoing {
        let half = window / 2.0;
        let remaining = duration - time;
        if half > 0.0 && remaining < half {
            factor = factor.min(remaining / half);
        }
    }
    factor.clamp(0.0, 1.0) as f32
}

/// Weight of the incoming frame during a dissolve, or `None` outside it.
pub fn dissolve_alpha(time: f64, incoming: Boundary) -> Option<f32> {
    match incoming {
        Boundary::Dissolve { window } if window > 0.0 && time < window => {
            Some((time / window).clamp(0.0, 1.0) as f32)
        }
        _ => None,
    }
}

pub fn scale_brightness(frame: &mut RgbImage, factor: f32) {
    if factor >= 1.0 {
        return;
    }
    for pixel in frame.pixels_mut() {
        for c in pixel.0.iter_mut() {
            *c = (*c as f32 * factor).round() as u8;
        }
    }
}

/// `incoming * alpha + outgoing * (1 - alpha)`, in place on `incoming`.
pub fn cross_blend(incoming: &mut RgbImage, outgoing: &RgbImage, alpha: f32) {
    if incoming.dimensions() != outgoing.dimensions() {
        return;
    }
    let alpha = alpha.clamp(0.0, 1.0);
    for (dst, src) in incoming.pixels_mut().zip(outgoing.pixels()) {
        for c in 0..3 {
            let value = dst.0[c] as f32 * alpha + src.0[c] as f32 * (1.0 - alpha);
            dst.0[c] = value.round() as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::Shot;
    use image::Rgb;

    #[test]
    fn test_window_is_clamped_to_half_the_shorter_shot() {
        assert!((transition_window(0.2, 4.0, 4.0) - 0.8).abs() < 1e-9);
        assert!((transition_window(0.5, 0.6, 4.0) - 0.3).abs() < 1e-9);
        assert!((transition_window(0.9, 10.0, 1.0) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_auto_resolution() {
        assert_eq!(resolve_kind(Transition::Auto, 0), Transition::Cut);
        assert_eq!(resolve_kind(Transition::Auto, 3), Transition::Fade);
        assert_eq!(resolve_kind(Transition::Dissolve, 0), Transition::Dissolve);
    }

    #[test]
    fn test_plan_boundaries() {
        let mut recipe = Recipe::default();
        let mut a = Shot::new(0.0, 2.0);
        a.transition_in = Transition::Dissolve;
        let b = Shot::new(2.0, 4.0);
        let mut c = Shot::new(4.0, 5.0);
        c.transition_in = Transition::Dissolve;
        let mut d = Shot::new(5.0, 7.0);
        d.transition_in = Transition::Cut;
        recipe.timeline = vec![a, b, c, d];

        let boundaries = plan_boundaries(&recipe, 0.2);
        assert_eq!(boundaries[0], Boundary::Cut);
        assert!(matches!(boundaries[1], Boundary::Fade { window } if (window - 0.4).abs() < 1e-9));
        assert!(matches!(boundaries[2], Boundary::Dissolve { window } if (window - 0.2).abs() < 1e-9));
        assert_eq!(boundaries[3], Boundary::Cut);
    }

    #[test]
    fn test_fade_factor_dips_to_black_at_the_boundary() {
        let fade = Boundary::Fade { window: 1.0 };
        assert_eq!(fade_factor(0.0, 4.0, fade, None), 0.0);
        assert!((fade_factor(0.25, 4.0, fade, None) - 0.5).abs() < 1e-6);
        assert_eq!(fade_factor(2.0, 4.0, fade, Some(fade)), 1.0);
        assert!(fade_factor(3.9, 4.0, Boundary::Cut, Some(fade)) < 0.25);
    }

    #[test]
    fn test_cross_blend_midpoint() {
        let mut incoming = RgbImage::from_pixel(2, 2, Rgb([200, 0, 0]));
        let outgoing = RgbImage::from_pixel(2, 2, Rgb([0, 0, 100]));
        cross_blend(&mut incoming, &outgoing, 0.5);
        assert_eq!(incoming.get_pixel(0, 0).0, [100, 0, 50]);
        assert_eq!(dissolve_alpha(0.5, Boundary::Dissolve { window: 1.0 }), Some(0.5));
        assert_eq!(dissolve_alpha(1.5, Boundary::Dissolve { window: 1.0 }), None);
    }
}
