// IMEI format check: 15 ASCII digits with a valid Luhn check digit

pub const IMEI_LENGTH: usize = 15;

pub fn is_valid_imei(imei: &str) -> bool {
    imei.len() == IMEI_LENGTH && imei.bytes().all(|b| b.is_ascii_digit()) && luhn_valid(imei)
}

fn luhn_valid(digits: &str) -> bool {
    let sum: u32 = digits
        .bytes()
        .rev()
        .map(|b| u32::from(b - b'0'))
        .enumerate()
        .map(|(i, d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
