use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// One step of a grading scale: percentages at or above `threshold` earn
/// `letter` with `modifier` ('0' plain, '1' minus, '2' plus).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeThreshold {
    pub threshold: f64,
    pub letter: String,
    pub modifier: String,
}

impl GradeThreshold {
    fn new(threshold: f64, letter: &str, modifier: &str) -> Self {
        Self {
            threshold,
            letter: letter.to_string(),
            modifier: modifier.to_string(),
        }
    }
}

pub fn default_grading_scale() -> Vec<GradeThreshold> {
    vec![
        GradeThreshold::new(0.0, "F", "0"),
        GradeThreshold::new(50.0, "D", "0"),
        GradeThreshold::new(55.0, "C", "1"),
        GradeThreshold::new(60.0, "C", "2"),
        GradeThreshold::new(65.0, "B", "1"),
        GradeThreshold::new(70.0, "B", "0"),
        GradeThreshold::new(75.0, "B", "2"),
        GradeThreshold::new(80.0, "A", "1"),
        GradeThreshold::new(85.0, "A", "0"),
        GradeThreshold::new(95.0, "A", "2"),
    ]
}

fn sort_by_threshold(grades: &mut [GradeThreshold]) {
    grades.sort_by(|a, b| {
        a.threshold
            .partial_cmp(&b.threshold)
            .unwrap_or(Ordering::Equal)
    });
}

/// `"0:F:0|50:D:0|..."`, sorted ascending by threshold.
pub fn encode_grading_scale(grades: &[GradeThreshold]) -> String {
    let mut sorted = grades.to_vec();
    sort_by_threshold(&mut sorted);
    sorted
        .iter()
        .map(|g| format!("{}:{}:{}", g.threshold, g.letter, g.modifier))
        .collect::<Vec<_>>()
        .join("|")
}

/// Malformed parts are skipped; a blank or fully malformed string yields the
/// default scale.
pub fn decode_grading_scale(encoded: Option<&str>) -> Vec<GradeThreshold> {
    let Some(encoded) = encoded.filter(|s| !s.trim().is_empty()) else {
        return default_grading_scale();
    };

    let mut grades: Vec<GradeThreshold> = Vec::new();
    for part in encoded.split('|') {
        let mut fields = part.split(':');
        let (Some(threshold), Some(letter), Some(modifier)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if letter.is_empty() || modifier.is_empty() {
            continue;
        }
        let Ok(threshold) = threshold.trim().parse::<f64>() else {
            continue;
        };
        if !threshold.is_finite() {
            continue;
        }
        grades.push(GradeThreshold {
            threshold,
            letter: letter.to_string(),
            modifier: modifier.to_string(),
        });
    }

    if grades.is_empty() {
        return default_grading_scale();
    }
    sort_by_threshold(&mut grades);
    grades
}

pub fn modifier_name(modifier: &str) -> &'static str {
    match modifier {
        "1" => "Minus",
        "2" => "Plus",
        _ => "Plain",
    }
}

pub fn grade_display(letter: &str, modifier: Option<&str>) -> String {
    if letter == "F" {
        return "F (Fail)".to_string();
    }
    let Some(modifier) = modifier.filter(|m| !m.is_empty()) else {
        return letter.to_string();
    };
    let symbol = match modifier {
        "1" => "-",
        "2" => "+",
        _ => "",
    };
    format!("{}{} ({})", letter, symbol, modifier_name(modifier))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LetterGrade {
    pub letter: String,
    pub modifier: String,
    pub display: String,
}

/// Highest threshold not above `percentage`; the lowest grade otherwise.
pub fn letter_grade(percentage: f64, grading_scale: Option<&str>) -> LetterGrade {
    let grades = decode_grading_scale(grading_scale);
    let selected = grades
        .iter()
        .rev()
        .find(|g| percentage >= g.threshold)
        .unwrap_or(&grades[0]);
    LetterGrade {
        letter: selected.letter.clone(),
        modifier: selected.modifier.clone(),
        display: grade_display(&selected.letter, Some(&selected.modifier)),
    }
}

/// `None` when valid, otherwise a message naming the first problem.
pub fn validate_grading_scale(grades: &[GradeThreshold]) -> Option<String> {
    if grades.is_empty() {
        return Some("Grading scale cannot be empty".to_string());
    }
    let mut sorted = grades.to_vec();
    sort_by_threshold(&mut sorted);

    if sorted[0].threshold != 0.0 {
        return Some("First threshold must start at 0%".to_string());
    }
    for pair in sorted.windows(2) {
        if pair[0].threshold == pair[1].threshold {
            return Some(format!("Duplicate threshold at {}%", pair[1].threshold));
        }
    }
    if sorted
        .iter()
        .any(|g| !(0.0..=100.0).contains(&g.threshold))
    {
        return Some("All thresholds must be between 0 and 100".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scale_encodes_compactly() {
        let encoded = encode_grading_scale(&default_grading_scale());
        assert!(encoded.starts_with("0:F:0|50:D:0|55:C:1"));
        assert_eq!(decode_grading_scale(Some(&encoded)), default_grading_scale());
    }

    #[test]
    fn decode_skips_malformed_parts_and_falls_back() {
        let grades = decode_grading_scale(Some("60:P:0|junk|0:F:0|x:A:0|70::0"));
        assert_eq!(
            grades,
            vec![GradeThreshold::new(0.0, "F", "0"), GradeThreshold::new(60.0, "P", "0")]
        );
        assert_eq!(decode_grading_scale(Some("|||")), default_grading_scale());
        assert_eq!(decode_grading_scale(None), default_grading_scale());
        assert_eq!(decode_grading_scale(Some("  ")), default_grading_scale());
    }

    #[test]
    fn letter_grade_picks_highest_reached_threshold() {
        assert_eq!(letter_grade(49.9, None).display, "F (Fail)");
        assert_eq!(letter_grade(50.0, None).display, "D (Plain)");
        assert_eq!(letter_grade(57.0, None).display, "C- (Minus)");
        assert_eq!(letter_grade(96.0, None).display, "A+ (Plus)");
        assert_eq!(letter_grade(-3.0, None).letter, "F");
        assert_eq!(letter_grade(72.0, Some("0:F:0|70:P:0")).letter, "P");
    }

    #[test]
    fn grade_display_without_modifier_is_bare_letter() {
        assert_eq!(grade_display("B", None), "B");
        assert_eq!(grade_display("B", Some("1")), "B- (Minus)");
        assert_eq!(grade_display("F", Some("2")), "F (Fail)");
    }

    #[test]
    fn validate_reports_first_problem() {
        assert_eq!(validate_grading_scale(&default_grading_scale()), None);
        assert_eq!(
            validate_grading_scale(&[]).as_deref(),
            Some("Grading scale cannot be empty")
        );
        assert_eq!(
            validate_grading_scale(&[GradeThreshold::new(10.0, "F", "0")]).as_deref(),
            Some("First threshold must start at 0%")
        );
        assert_eq!(
            validate_grading_scale(&[
                GradeThreshold::new(0.0, "F", "0"),
                GradeThreshold::new(50.0, "D", "0"),
                GradeThreshold::new(50.0, "C", "0"),
            ])
            .as_deref(),
            Some("Duplicate threshold at 50%")
        );
        assert_eq!(
            validate_grading_scale(&[
                GradeThreshold::new(0.0, "F", "0"),
                GradeThreshold::new(120.0, "A", "2"),
            ])
            .as_deref(),
            Some("All thresholds must be between 0 and 100")
        );
    }
}
