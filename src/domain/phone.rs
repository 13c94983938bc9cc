const HOME_CALLING_CODE: &str = "91";
const LOCAL_NUMBER_LEN: usize = 10;

/// Canonical form is the local significant number: calling code and trunk
/// zeros are dropped whenever more than ten digits are present.
pub fn normalize(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    let digits = match digits.len() > LOCAL_NUMBER_LEN
        && (digits.starts_with(HOME_CALLING_CODE) || digits.starts_with('0'))
    {
        true => digits[digits.len() - LOCAL_NUMBER_LEN..].to_string(),
        false => digits,
    };

    match digits.len() < LOCAL_NUMBER_LEN {
        true => None,
        false => Some(digits),
    }
}
