use anyhow::{Context, Result};
use image::DynamicImage;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;

use crate::recipe::TextBox;

/// Result of locating text on one frame
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TextLocation {
    pub boxes: Vec<TextBox>,
    /// Why the locator returned nothing, when it could not run
    pub failure: Option<String>,
}

/// On-screen text finder backed by the `tesseract` command-line tool.
pub struct TextLocator {
    languages: Vec<String>,
    min_confidence: f64,
    binary: Option<PathBuf>,
}

impl TextLocator {
    pub fn new(languages: &[String], min_confidence: f64) -> Self {
        Self {
            languages: languages.to_vec(),
            min_confidence,
            binary: which::which("tesseract").ok(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.binary.is_some()
    }

    /// Never fails: problems yield an empty list with a reason.
    pub fn locate(&self, frame: &DynamicImage) -> TextLocation {
        match self.run(frame) {
            Ok(boxes) => TextLocation {
                boxes,
                failure: None,
            },
            Err(e) => TextLocation {
                boxes: Vec::new(),
                failure: Some(format!("{:#}", e)),
            },
        }
    }

    fn run(&self, frame: &DynamicImage) -> Result<Vec<TextBox>> {
        let binary = self.binary.as_ref().context("tesseract not found in PATH")?;

        let image_path = std::env::temp_dir().join(format!("adgen-ocr-{}.png", uuid::Uuid::new_v4()));
        frame
            .to_rgb8()
            .save(&image_path)
            .with_context(|| format!("failed to write OCR input: {}", image_path.display()))?;

        let output = Command::new(binary)
            .arg(&image_path)
            .arg("stdout")
            .arg("-l")
            .arg(tesseract_languages(&self.languages))
            .arg("--psm")
            .arg("11")
            .arg("tsv")
            .output();
        let _ = std::fs::remove_file(&image_path);
        let output = output.context("failed to run tesseract")?;

        if !output.status.success() {
            anyhow::bail!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout), self.min_confidence))
    }
}

/// ISO 639-1 codes to tesseract traineddata names, joined with `+`.
fn tesseract_languages(languages: &[String]) -> String {
    let mapped: Vec<&str> = languages
        .iter()
        .map(|l| match l.as_str() {
            "ko" => "kor",
            "en" => "eng",
            "ja" => "jpn",
            "zh" => "chi_sim",
            other => other,
        })
        .collect();
    if mapped.is_empty() {
        "eng".to_string()
    } else {
        mapped.join("+")
    }
}

/// Group word rows of tesseract TSV into line boxes.
///
/// A line's confidence is the mean of its words (0-100 rescaled to 0-1);
/// lines below `min_confidence` are dropped.
pub fn parse_tsv(tsv: &str, min_confidence: f64) -> Vec<TextBox> {
    struct Line {
        words: Vec<String>,
        conf_sum: f64,
        bbox: [u32; 4],
    }

    let mut lines: BTreeMap<(u32, u32, u32, u32), Line> = BTreeMap::new();
    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }
        let num = |i: usize| cols[i].trim().parse::<i64>().ok();
        let (Some(page), Some(block), Some(par), Some(line)) = (num(1), num(2), num(3), num(4))
        else {
            continue;
        };
        let (Some(left), Some(top), Some(width), Some(height)) = (num(6), num(7), num(8), num(9))
        else {
            continue;
        };
        let Ok(conf) = cols[10].trim().parse::<f64>() else {
            continue;
        };
        let text = cols[11].trim();
        if text.is_empty() || conf < 0.0 {
            continue;
        }

        let word_box = [
            left.max(0) as u32,
            top.max(0) as u32,
            (left + width).max(0) as u32,
            (top + height).max(0) as u32,
        ];
        let key = (page as u32, block as u32, par as u32, line as u32);
        let entry = lines.entry(key).or_insert_with(|| Line {
            words: Vec::new(),
            conf_sum: 0.0,
            bbox: word_box,
        });
        entry.words.push(text.to_string());
        entry.conf_sum += conf;
        entry.bbox = [
            entry.bbox[0].min(word_box[0]),
            entry.bbox[1].min(word_box[1]),
            entry.bbox[2].max(word_box[2]),
            entry.bbox[3].max(word_box[3]),
        ];
    }

    lines
        .into_values()
        .map(|line| TextBox {
            confidence: line.conf_sum / line.words.len() as f64 / 100.0,
            text: line.words.join(" "),
            bbox: line.bbox,
        })
        .filter(|b| b.confidence >= min_confidence)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "level\tpage_num\tblock_num\tpar_num\tline_num\tword_num\tleft\ttop\twidth\theight\tconf\ttext";

    #[test]
    fn test_words_group_into_lines() {
        let tsv = format!(
            "{HEADER}\n\
             1\t1\t0\t0\t0\t0\t0\t0\t720\t1280\t-1\t\n\
             5\t1\t1\t1\t1\t1\t100\t200\t80\t40\t91.5\tSUMMER\n\
             5\t1\t1\t1\t1\t2\t190\t205\t60\t38\t88.5\tSALE\n\
             5\t1\t2\t1\t1\t1\t50\t900\t120\t30\t30.0\tblurry\n"
        );
        let boxes = parse_tsv(&tsv, 0.5);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].text, "SUMMER SALE");
        assert_eq!(boxes[0].bbox, [100, 200, 250, 243]);
        assert!((boxes[0].confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_language_mapping() {
        let langs = vec!["ko".to_string(), "en".to_string()];
        assert_eq!(tesseract_languages(&langs), "kor+eng");
        assert_eq!(tesseract_languages(&[]), "eng");
    }

    #[test]
    fn test_missing_binary_degrades_to_empty() {
        let locator = TextLocator {
            languages: vec!["en".into()],
            min_confidence: 0.5,
            binary: None,
        };
        let frame = DynamicImage::new_rgb8(16, 16);
        let location = locator.locate(&frame);
        assert!(location.boxes.is_empty());
        assert!(location.failure.is_some());
    }
}
