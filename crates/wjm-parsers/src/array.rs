//! Array submission spec: `N-M`, `N-M:S`, or a comma list of indices.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArrayError {
    #[error("invalid array spec '{0}': expected N-M, N-M:S, or a comma list")]
    Malformed(String),
    #[error("array spec '{0}' expands to no elements")]
    Empty(String),
    #[error("array spec '{0}' expands to {1} elements (limit {max})", max = MAX_ELEMENTS)]
    TooLarge(String, usize),
}

/// Upper bound on one array expansion; the id space itself only has 999
/// slots.
pub const MAX_ELEMENTS: usize = 200;

/// Expand an array spec into its element indices, in order.
pub fn parse_array_spec(s: &str) -> Result<Vec<u32>, ArrayError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(ArrayError::Malformed(s.to_string()));
    }

    let indices = if s.contains(',') {
        s.split(',')
            .map(|p| p.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ArrayError::Malformed(s.to_string()))?
    } else if let Some((range, step)) = split_range(s)? {
        let (start, end) = range;
        if start > end || step == 0 {
            return Err(ArrayError::Malformed(s.to_string()));
        }
        (start..=end).step_by(step as usize).collect()
    } else {
        vec![s.parse::<u32>().map_err(|_| ArrayError::Malformed(s.to_string()))?]
    };

    if indices.is_empty() {
        return Err(ArrayError::Empty(s.to_string()));
    }
    if indices.len() > MAX_ELEMENTS {
        return Err(ArrayError::TooLarge(s.to_string(), indices.len()));
    }
    Ok(indices)
}

type Range = ((u32, u32), u32);

fn split_range(s: &str) -> Result<Option<Range>, ArrayError> {
    let Some((bounds, rest)) = s.split_once('-') else {
        return Ok(None);
    };
    let (end_str, step) = match rest.split_once(':') {
        Some((end, step)) => {
            let step: u32 = step
                .trim()
                .parse()
                .map_err(|_| ArrayError::Malformed(s.to_string()))?;
            (end, step)
        }
        None => (rest, 1),
    };
    let start: u32 = bounds
        .trim()
        .parse()
        .map_err(|_| ArrayError::Malformed(s.to_string()))?;
    let end: u32 = end_str
        .trim()
        .parse()
        .map_err(|_| ArrayError::Malformed(s.to_string()))?;
    Ok(Some(((start, end), step)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range() {
        assert_eq!(parse_array_spec("1-5").unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(parse_array_spec("0-8:4").unwrap(), vec![0, 4, 8]);
        assert_eq!(parse_array_spec("3-3").unwrap(), vec![3]);
    }

    #[test]
    fn test_list_and_single() {
        assert_eq!(parse_array_spec("2,4,9").unwrap(), vec![2, 4, 9]);
        assert_eq!(parse_array_spec("7").unwrap(), vec![7]);
    }

    #[test]
    fn test_rejects() {
        assert!(parse_array_spec("").is_err());
        assert!(parse_array_spec("5-1").is_err());
        assert!(parse_array_spec("1-5:0").is_err());
        assert!(parse_array_spec("a-b").is_err());
        assert!(matches!(
            parse_array_spec("1-1000"),
            Err(ArrayError::TooLarge(_, 1000))
        ));
    }
}
