/// Which end of a sequence receives pad tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadSide {
    Left,
    Right,
}

/// Bring `tokens` to exactly `length` ids: pad with `pad` on `side` when
/// shorter, keep the last `length` ids when longer.
pub fn fit_length(tokens: &[u32], length: usize, pad: u32, side: PadSide) -> Vec<u32> {
    if tokens.len() >= length {
        return tokens[tokens.len() - length..].to_vec();
    }
    let fill = std::iter::repeat(pad).take(length - tokens.len());
    match side {
        PadSide::Left => fill.chain(tokens.iter().copied()).collect(),
        PadSide::Right => tokens.iter().copied().chain(fill).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn left_pad_short_seed() {
        assert_eq!(fit_length(&[7, 8, 9], 5, 0, PadSide::Left), vec![0, 0, 7, 8, 9]);
    }

    #[test]
    fn right_pad_short_seed() {
        assert_eq!(fit_length(&[7, 8, 9], 5, 0, PadSide::Right), vec![7, 8, 9, 0, 0]);
    }

    #[test]
    fn truncate_keeps_tail() {
        let seq = [1, 2, 3, 4, 5, 6, 7];
        assert_eq!(fit_length(&seq, 3, 0, PadSide::Left), vec![5, 6, 7]);
        assert_eq!(fit_length(&seq, 3, 0, PadSide::Right), vec![5, 6, 7]);
    }

    #[test]
    fn exact_length_untouched() {
        assert_eq!(fit_length(&[4, 5], 2, 0, PadSide::Left), vec![4, 5]);
    }

    #[test]
    fn empty_input_is_all_pad() {
        assert_eq!(fit_length(&[], 3, 9, PadSide::Right), vec![9, 9, 9]);
    }
}
