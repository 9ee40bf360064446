pub fn parse_u64_with_prefix(value: &str) -> Option<u64> {
    let (value, radix) = if let Some(hex) = value.strip_prefix("0x") {
        (hex, 16)
    }
    else if let Some(bin) = value.strip_prefix("0b") {
        (bin, 2)
    }
    else {
        (value, 10)
    };

    u64::from_str_radix(value, radix).ok()
}
