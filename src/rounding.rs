use crate::scaling::ScaledMark;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundedMark {
    pub student_id: String,
    pub rounded_mark: f64,
}

/// Round a scaled mark to a whole number.
///
/// With `round_half_up` an exact .5 goes up; without it an exact .5 goes
/// down and only fractions strictly above .5 go up.
pub fn round_mark(x: f64, round_half_up: bool) -> f64 {
    let floor = x.floor();
    let decimal = x - floor;
    let up = if round_half_up {
        decimal >= 0.5
    } else {
        decimal > 0.5
    };
    if up {
        x.ceil()
    } else {
        floor
    }
}

/// Non-finite inputs are left out of the result.
pub fn round_marks(scaled: &[ScaledMark], round_half_up: bool) -> Vec<RoundedMark> {
    scaled
        .iter()
        .filter(|m| m.scaled_mark.is_finite())
        .map(|m| RoundedMark {
            student_id: m.student_id.clone(),
            rounded_mark: round_mark(m.scaled_mark, round_half_up),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaled(id: &str, v: f64) -> ScaledMark {
        ScaledMark {
            student_id: id.to_string(),
            scaled_mark: v,
        }
    }

    #[test]
    fn half_is_the_only_asymmetric_case() {
        assert_eq!(round_mark(2.5, true), 3.0);
        assert_eq!(round_mark(2.5, false), 2.0);
        for half_up in [true, false] {
            assert_eq!(round_mark(2.4, half_up), 2.0);
            assert_eq!(round_mark(2.6, half_up), 3.0);
            assert_eq!(round_mark(0.0, half_up), 0.0);
        }
        assert_eq!(round_mark(49.5, true), 50.0);
        assert_eq!(round_mark(49.51, false), 50.0);
    }

    #[test]
    fn rounding_integers_is_a_no_op() {
        for v in [0.0, 1.0, 17.0, 72.0, 100.0] {
            for half_up in [true, false] {
                let once = round_mark(v, half_up);
                assert_eq!(once, v);
                assert_eq!(round_mark(once, half_up), once);
            }
        }
    }

    #[test]
    fn round_marks_keeps_order_and_drops_non_finite() {
        let input = vec![
            scaled("a", 33.33),
            scaled("b", f64::NAN),
            scaled("c", 66.5),
            scaled("d", 100.0),
        ];
        let out = round_marks(&input, false);
        assert_eq!(
            out,
            vec![
                RoundedMark {
                    student_id: "a".into(),
                    rounded_mark: 33.0
                },
                RoundedMark {
                    student_id: "c".into(),
                    rounded_mark: 66.0
                },
                RoundedMark {
                    student_id: "d".into(),
                    rounded_mark: 100.0
                },
            ]
        );
        let reround: Vec<ScaledMark> = out
            .iter()
            .map(|r| scaled(&r.student_id, r.rounded_mark))
            .collect();
        assert_eq!(round_marks(&reround, true), out);
    }
}
