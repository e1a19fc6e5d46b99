//! The 16-bit one's-complement Internet checksum (RFC 1071) and DCCP's partial checksum
//!  coverage. The IP pseudo-header is the IP layer's business and not part of the sum here.

/// Number of leading bytes of a segment that are covered by the checksum.
///
/// Coverage code 0 covers the whole segment, `k > 0` covers the header (including options) plus
///  `k - 1` words of payload. The result never exceeds the segment length.
pub fn coverage_len(coverage: u8, header_len: usize, segment_len: usize) -> usize {
    if coverage == 0 {
        return segment_len;
    }
    let covered = header_len + (coverage as usize - 1) * 4;
    covered.min(segment_len)
}

pub fn internet_checksum(data: &[u8]) -> u16 {
    !fold(sum_words(data))
}

/// A covered prefix that includes a correct checksum field sums to `0xffff`.
pub fn verify(data: &[u8]) -> bool {
    fold(sum_words(data)) == 0xffff
}

fn sum_words(data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    let mut sum: u32 = 0;
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([chunk[0], chunk[1]]) as u32);
        sum = (sum & 0xffff) + (sum >> 16);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::whole(0, 16, 100, 100)]
    #[case::header_only(1, 16, 100, 16)]
    #[case::one_word(2, 16, 100, 20)]
    #[case::max_code(15, 16, 200, 72)]
    #[case::clamped(15, 16, 40, 40)]
    #[case::header_with_options(3, 24, 100, 32)]
    fn test_coverage_len(#[case] coverage: u8, #[case] header_len: usize, #[case] segment_len: usize, #[case] expected: usize) {
        assert_eq!(coverage_len(coverage, header_len, segment_len), expected);
    }

    #[test]
    fn test_rfc1071_example() {
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(internet_checksum(&data), !0xddf2);
    }

    #[rstest]
    #[case::even(vec![1, 2, 0, 0, 3, 4, 5, 6])]
    #[case::odd(vec![1, 2, 0, 0, 3, 4, 5])]
    fn test_verify_after_insert(#[case] mut data: Vec<u8>) {
        let checksum = internet_checksum(&data);
        data[2..4].copy_from_slice(&checksum.to_be_bytes());
        assert!(verify(&data));

        data[0] ^= 0x40;
        assert!(!verify(&data));
    }
}
