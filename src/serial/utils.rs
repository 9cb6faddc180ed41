//! Conversions between the gateway's plain serial settings and the
//! `serialport` crate's configuration types.

use serialport::{DataBits, Parity as SpParity, StopBits};

pub fn parity_str_to_serialport(s: &str) -> SpParity {
    match s.to_uppercase().as_str() {
        "O" => SpParity::Odd,
        "E" => SpParity::Even,
        _ => SpParity::None,
    }
}

pub fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

pub fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_letters_map_correctly() {
        assert!(matches!(parity_str_to_serialport("E"), SpParity::Even));
        assert!(matches!(parity_str_to_serialport("O"), SpParity::Odd));
        assert!(matches!(parity_str_to_serialport("N"), SpParity::None));
        assert!(matches!(parity_str_to_serialport("x"), SpParity::None));
    }

    #[test]
    fn data_bits_defaults_to_eight() {
        assert!(matches!(to_serialport_data_bits(7), DataBits::Seven));
        assert!(matches!(to_serialport_data_bits(8), DataBits::Eight));
        assert!(matches!(to_serialport_data_bits(5), DataBits::Eight));
    }

    #[test]
    fn stop_bits_defaults_to_one() {
        assert!(matches!(to_serialport_stop_bits(2), StopBits::Two));
        assert!(matches!(to_serialport_stop_bits(1), StopBits::One));
        assert!(matches!(to_serialport_stop_bits(0), StopBits::One));
    }
}
