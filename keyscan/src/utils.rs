use std::str::FromStr;

const SEPARATORS: [char; 3] = [',', ' ', ';'];

fn parse_list<T: FromStr>(list_str: &str) -> Result<Vec<T>, T::Err> {
    list_str
        .split(SEPARATORS)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse())
        .collect()
}

/// Parses a list of pin numbers separated by commas, spaces or semicolons.
pub fn parse_pin_list(pin_str: &str) -> Result<Vec<usize>, std::num::ParseIntError> {
    parse_list(pin_str)
}

/// Parses key matrix rows, e.g. `123A,456B,789C,*0#D`.
///
/// Rows are separated like pin lists. Every character of a row is one key.
pub fn parse_key_rows(keys_str: &str) -> Vec<String> {
    keys_str
        .split(SEPARATORS)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parses a pair of microsecond values like `50000,500000`.
pub fn parse_micros_pair(pair_str: &str) -> Option<(u64, u64)> {
    match parse_list::<u64>(pair_str).ok()?.as_slice() {
        &[a, b] => Some((a, b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_list_separators() {
        assert_eq!(parse_pin_list("18,23, 24;25"), Ok(vec![18, 23, 24, 25]));
        assert_eq!(parse_pin_list("  4  17 "), Ok(vec![4, 17]));
        assert_eq!(parse_pin_list(""), Ok(vec![]));
        assert!(parse_pin_list("4,x").is_err());
    }

    #[test]
    fn key_rows() {
        assert_eq!(parse_key_rows("123A,456B; 789C *0#D"), vec!["123A", "456B", "789C", "*0#D"]);
    }

    #[test]
    fn micros_pair() {
        assert_eq!(parse_micros_pair("50000,500000"), Some((50000, 500000)));
        assert_eq!(parse_micros_pair("50000"), None);
        assert_eq!(parse_micros_pair("a,b"), None);
        assert_eq!(parse_micros_pair("1,-2"), None);
        // Beyond a 32-bit usize.
        assert_eq!(parse_micros_pair("5000000000,1"), Some((5_000_000_000, 1)));
    }
}
