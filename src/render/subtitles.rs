use crate::recipe::Recipe;

/// `HH:MM:SS,mmm`
pub fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let (hours, rem) = (total_ms / 3_600_000, total_ms % 3_600_000);
    let (minutes, rem) = (rem / 60_000, rem % 60_000);
    let (secs, millis) = (rem / 1000, rem % 1000);
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

/// SRT with one cue per captioned shot, timed on the output timeline
/// (shots laid end to end), or `None` when no shot has a caption.
pub fn build_srt(recipe: &Recipe, fps: u32) -> Option<String> {
    let mut cues = Vec::new();
    let mut cursor = 0.0;
    for shot in &recipe.timeline {
        let length = output_length(shot.duration(), fps);
        if let Some(caption) = shot.caption_text() {
            cues.push((cursor, cursor + length, caption.to_string()));
        }
        cursor += length;
    }
    if cues.is_empty() {
        return None;
    }

    let mut srt = String::new();
    for (i, (start, end, text)) in cues.iter().enumerate() {
        srt.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_timestamp(*start),
            format_timestamp(*end),
            text
        ));
    }
    Some(srt)
}

/// Frames a shot occupies in the output.
pub fn frame_count(duration: f64, fps: u32) -> usize {
    ((duration.max(0.0) * fps as f64).round() as usize).max(1)
}

/// Shot length as actually rendered, after rounding to whole frames.
pub fn output_length(duration: f64, fps: u32) -> f64 {
    frame_count(duration, fps) as f64 / fps.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Layer, Shot};

    #[test]
    fn test_timestamp_format() {
        assert_eq!(format_timestamp(0.0), "00:00:00,000");
        assert_eq!(format_timestamp(3725.5), "01:02:05,500");
        assert_eq!(format_timestamp(-1.0), "00:00:00,000");
    }

    #[test]
    fn test_cues_follow_output_timeline() {
        let mut recipe = Recipe::default();
        let mut a = Shot::new(10.0, 12.0);
        a.caption = Some("Grand opening".into());
        let b = Shot::new(12.0, 13.5);
        let mut c = Shot::new(20.0, 21.0);
        c.layers.push(Layer::text("Visit today"));
        recipe.timeline = vec![a, b, c];

        let srt = build_srt(&recipe, 30).unwrap();
        assert_eq!(
            srt,
            "1\n00:00:00,000 --> 00:00:02,000\nGrand opening\n\n\
             2\n00:00:03,500 --> 00:00:04,500\nVisit today\n\n"
        );
    }

    #[test]
    fn test_no_captions_no_file() {
        let mut recipe = Recipe::default();
        recipe.timeline.push(Shot::new(0.0, 1.0));
        assert_eq!(build_srt(&recipe, 30), None);
    }
}
