use crate::pdu::{InsufficientBuffer, ParseError};
use heapless::Vec;

#[cfg(feature = "defmt")]
use defmt::Format;

pub const FILTER_SET: u8 = 0x00;
pub const FILTER_ADD: u8 = 0x01;
pub const FILTER_REMOVE: u8 = 0x02;
pub const FILTER_STATUS: u8 = 0x03;

/// Upper bound of addresses decoded from one configuration message.
pub const MAX_ADDRESSES: usize = 16;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum FilterType {
    Accept,
    Reject,
}

impl FilterType {
    pub fn parse(data: u8) -> Result<Self, ParseError> {
        match data {
            0x00 => Ok(Self::Accept),
            0x01 => Ok(Self::Reject),
            _ => Err(ParseError::InvalidValue),
        }
    }

    pub fn emit(&self) -> u8 {
        match self {
            Self::Accept => 0x00,
            Self::Reject => 0x01,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum ProxyConfigMessage {
    SetFilterType(FilterType),
    AddAddresses(Vec<u16, MAX_ADDRESSES>),
    RemoveAddresses(Vec<u16, MAX_ADDRESSES>),
    FilterStatus { filter_type: FilterType, list_size: u16 },
}

impl ProxyConfigMessage {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::SetFilterType(_) => FILTER_SET,
            Self::AddAddresses(_) => FILTER_ADD,
            Self::RemoveAddresses(_) => FILTER_REMOVE,
            Self::FilterStatus { .. } => FILTER_STATUS,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let (opcode, parameters) = data.split_first().ok_or(ParseError::InvalidLength)?;
        match *opcode {
            FILTER_SET => Self::parse_set_filter_type(parameters),
            FILTER_ADD => Ok(Self::AddAddresses(Self::parse_addresses(parameters)?)),
            FILTER_REMOVE => Ok(Self::RemoveAddresses(Self::parse_addresses(parameters)?)),
            FILTER_STATUS => Self::parse_filter_status(parameters),
            _ => Err(ParseError::InvalidPDUFormat),
        }
    }

    fn parse_set_filter_type(data: &[u8]) -> Result<Self, ParseError> {
        let filter_type = data.first().ok_or(ParseError::InvalidLength)?;
        Ok(Self::SetFilterType(FilterType::parse(*filter_type)?))
    }

    // A trailing odd byte is ignored.
    fn parse_addresses(data: &[u8]) -> Result<Vec<u16, MAX_ADDRESSES>, ParseError> {
        let mut addrs = Vec::new();
        for chunk in data.chunks_exact(2) {
            addrs
                .push(u16::from_be_bytes([chunk[0], chunk[1]]))
                .map_err(|_| ParseError::InsufficientBuffer)?;
        }
        Ok(addrs)
    }

    fn parse_filter_status(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() >= 3 {
            Ok(Self::FilterStatus {
                filter_type: FilterType::parse(data[0])?,
                list_size: u16::from_be_bytes([data[1], data[2]]),
            })
        } else {
            Err(ParseError::InvalidLength)
        }
    }

    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        xmit.push(self.opcode()).map_err(|_| InsufficientBuffer)?;
        match self {
            Self::SetFilterType(filter_type) => {
                xmit.push(filter_type.emit()).map_err(|_| InsufficientBuffer)?;
            }
            Self::AddAddresses(addrs) | Self::RemoveAddresses(addrs) => {
                for addr in addrs {
                    xmit.extend_from_slice(&addr.to_be_bytes())?;
                }
            }
            Self::FilterStatus {
                filter_type,
                list_size,
            } => {
                xmit.push(filter_type.emit()).map_err(|_| InsufficientBuffer)?;
                xmit.extend_from_slice(&list_size.to_be_bytes())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_set() {
        assert_eq!(
            ProxyConfigMessage::parse(&[0x00, 0x01]),
            Ok(ProxyConfigMessage::SetFilterType(FilterType::Reject))
        );
        assert_eq!(
            ProxyConfigMessage::parse(&[0x00, 0x02]),
            Err(ParseError::InvalidValue)
        );
        assert_eq!(
            ProxyConfigMessage::parse(&[0x00]),
            Err(ParseError::InvalidLength)
        );
    }

    #[test]
    fn parse_add_ignores_trailing_byte() {
        let msg = ProxyConfigMessage::parse(&[0x01, 0x12, 0x34, 0xC0, 0x01, 0x7F]).unwrap();
        match msg {
            ProxyConfigMessage::AddAddresses(addrs) => assert_eq!(&addrs[..], &[0x1234, 0xC001]),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_opcode() {
        assert_eq!(
            ProxyConfigMessage::parse(&[0x09, 0x00]),
            Err(ParseError::InvalidPDUFormat)
        );
        assert_eq!(ProxyConfigMessage::parse(&[]), Err(ParseError::InvalidLength));
    }

    #[test]
    fn emit_status() {
        let mut xmit: Vec<u8, 8> = Vec::new();
        ProxyConfigMessage::FilterStatus {
            filter_type: FilterType::Reject,
            list_size: 0x0102,
        }
        .emit(&mut xmit)
        .unwrap();
        assert_eq!(&xmit[..], &[0x03, 0x01, 0x01, 0x02]);
    }

    #[test]
    fn emit_remove() {
        let mut addrs = Vec::new();
        addrs.push(0x0001).unwrap();
        addrs.push(0xFFFF).unwrap();
        let mut xmit: Vec<u8, 8> = Vec::new();
        ProxyConfigMessage::RemoveAddresses(addrs)
            .emit(&mut xmit)
            .unwrap();
        assert_eq!(&xmit[..], &[0x02, 0x00, 0x01, 0xFF, 0xFF]);
    }
}
