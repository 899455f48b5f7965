//! Small utility helpers used across modules.

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
/// This is intentionally simple (no nested/conditional logic).
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Arithmetic mean of a slice, or None when empty.
pub fn mean(values: &[f64]) -> Option<f64> {
  if values.is_empty() {
    None
  } else {
    Some(values.iter().sum::<f64>() / values.len() as f64)
  }
}

/// Round to two decimals, the precision DNA snapshots store.
pub fn round2(v: f64) -> f64 {
  (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn fill_template_replaces_all_pairs() {
    let out = fill_template("{a} and {b} and {a}", &[("a", "x"), ("b", "y")]);
    assert_eq!(out, "x and y and x");
  }

  #[test]
  fn mean_handles_empty_and_values() {
    assert_eq!(mean(&[]), None);
    assert_eq!(mean(&[20.0, 40.0]), Some(30.0));
  }

  #[test]
  fn round2_keeps_two_decimals() {
    assert_eq!(round2(69.399_999_99), 69.4);
    assert_eq!(round2(61.25), 61.25);
  }
}
