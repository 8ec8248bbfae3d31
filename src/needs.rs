//! Asset roles a shot asks for, inferred from its analysis.

use std::collections::BTreeSet;

use crate::recipe::{ChecklistItem, MotionKind, ShotAnalysis};

/// A role inferred when any keyword occurs in the shot's on-screen text.
pub struct KeywordRule {
    pub role: &'static str,
    pub keywords: &'static [&'static str],
}

pub const KEYWORD_RULES: &[KeywordRule] = &[
    KeywordRule {
        role: "offer_text",
        keywords: &["할인", "discount", "sale", "off", "%", "원", "won"],
    },
    KeywordRule {
        role: "cta_text",
        keywords: &["지금", "now", "방문", "visit", "구매", "buy", "신청", "apply"],
    },
    KeywordRule {
        role: "brand_logo",
        keywords: &["카페", "cafe", "스토어", "store", "브랜드", "brand"],
    },
];

struct BaseItem {
    key: &'static str,
    kind: &'static str,
    desc: &'static str,
    required: bool,
}

const BASE_ITEMS: &[BaseItem] = &[
    BaseItem { key: "product", kind: "image", desc: "Main product photo", required: true },
    BaseItem { key: "brand_color", kind: "color", desc: "Brand colour", required: false },
    BaseItem { key: "brand_logo", kind: "image", desc: "Brand logo", required: false },
    BaseItem { key: "offer_text", kind: "text", desc: "Offer or discount copy", required: false },
    BaseItem { key: "cta_text", kind: "text", desc: "Call-to-action copy", required: false },
    BaseItem { key: "store_exterior", kind: "image", desc: "Store exterior or location footage", required: false },
    BaseItem { key: "product_shot", kind: "video", desc: "Close-up product footage", required: false },
];

pub fn infer_needs(analysis: &ShotAnalysis) -> BTreeSet<String> {
    let mut needs = BTreeSet::from(["product".to_string()]);

    if !analysis.palette.is_empty() {
        needs.insert("brand_color".to_string());
    }

    let text = analysis
        .text_boxes
        .iter()
        .map(|b| b.text.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");
    if !text.is_empty() {
        for rule in KEYWORD_RULES {
            if rule.keywords.iter().any(|k| text.contains(k)) {
                needs.insert(rule.role.to_string());
            }
        }
    }

    match analysis.motion.kind {
        MotionKind::Pan | MotionKind::PanHorizontal | MotionKind::PanVertical => {
            needs.insert("store_exterior".to_string());
        }
        MotionKind::Zoom => {
            needs.insert("product_shot".to_string());
        }
        MotionKind::Static => {}
    }
    needs
}

/// Checklist of base items that are required or needed by at least one shot.
pub fn build_checklist<'a, I>(shot_needs: I) -> Vec<ChecklistItem>
where
    I: IntoIterator<Item = &'a BTreeSet<String>>,
{
    let all: Vec<&BTreeSet<String>> = shot_needs.into_iter().collect();
    BASE_ITEMS
        .iter()
        .map(|item| ChecklistItem {
            key: item.key.to_string(),
            kind: item.kind.to_string(),
            desc: item.desc.to_string(),
            required: item.required,
            frequency: all.iter().filter(|n| n.contains(item.key)).count(),
        })
        .filter(|item| item.required || item.frequency > 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{ShotMotion, TextBox};

    fn with_text(text: &str) -> ShotAnalysis {
        ShotAnalysis {
            text_boxes: vec![TextBox {
                text: text.to_string(),
                bbox: [0, 0, 10, 10],
                confidence: 0.9,
            }],
            ..ShotAnalysis::default()
        }
    }

    #[test]
    fn test_product_is_always_needed() {
        let needs = infer_needs(&ShotAnalysis::default());
        assert_eq!(needs, BTreeSet::from(["product".to_string()]));
    }

    #[test]
    fn test_keyword_table() {
        let needs = infer_needs(&with_text("SUMMER SALE 30% - Visit now"));
        assert!(needs.contains("offer_text"));
        assert!(needs.contains("cta_text"));
        assert!(!needs.contains("brand_logo"));

        let korean = infer_needs(&with_text("카페 오픈 기념 할인"));
        assert!(korean.contains("brand_logo"));
        assert!(korean.contains("offer_text"));
    }

    #[test]
    fn test_motion_and_palette_needs() {
        let analysis = ShotAnalysis {
            motion: ShotMotion {
                kind: MotionKind::PanHorizontal,
                ..ShotMotion::default()
            },
            palette: vec!["#FFFFFF".into()],
            ..ShotAnalysis::default()
        };
        let needs = infer_needs(&analysis);
        assert!(needs.contains("store_exterior"));
        assert!(needs.contains("brand_color"));
    }

    #[test]
    fn test_checklist_frequency() {
        let a = infer_needs(&with_text("sale"));
        let b = infer_needs(&with_text("buy now"));
        let c = infer_needs(&ShotAnalysis::default());
        let checklist = build_checklist([&a, &b, &c]);
        let keys: Vec<&str> = checklist.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["product", "offer_text", "cta_text"]);
        assert_eq!(checklist[0].frequency, 3);
        assert!(checklist[0].required);
        assert_eq!(checklist[1].frequency, 1);
    }
}
