use crate::pdu::InsufficientBuffer;
use heapless::Vec;

#[cfg(feature = "defmt")]
use defmt::Format;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum SAR {
    Complete,
    First,
    Continuation,
    Last,
}

impl SAR {
    pub fn parse(data: u8) -> Self {
        match data >> 6 {
            0b00 => Self::Complete,
            0b01 => Self::First,
            0b10 => Self::Continuation,
            _ => Self::Last,
        }
    }

    pub fn emit(&self) -> u8 {
        match self {
            Self::Complete => 0b00 << 6,
            Self::First => 0b01 << 6,
            Self::Continuation => 0b10 << 6,
            Self::Last => 0b11 << 6,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum MessageType {
    NetworkPDU,
    MeshBeacon,
    ProxyConfiguration,
    ProvisioningPDU,
    Other(u8),
}

impl MessageType {
    pub fn parse(data: u8) -> Self {
        match data & 0b00111111 {
            0x00 => Self::NetworkPDU,
            0x01 => Self::MeshBeacon,
            0x02 => Self::ProxyConfiguration,
            0x03 => Self::ProvisioningPDU,
            other => Self::Other(other),
        }
    }

    pub fn emit(&self) -> u8 {
        match self {
            Self::NetworkPDU => 0x00,
            Self::MeshBeacon => 0x01,
            Self::ProxyConfiguration => 0x02,
            Self::ProvisioningPDU => 0x03,
            Self::Other(other) => *other & 0b00111111,
        }
    }
}

/// The one byte header leading every proxy PDU fragment.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct Header {
    pub sar: SAR,
    pub message_type: MessageType,
}

impl Header {
    pub fn new(sar: SAR, message_type: MessageType) -> Self {
        Self { sar, message_type }
    }

    pub fn parse(data: u8) -> Self {
        Self {
            sar: SAR::parse(data),
            message_type: MessageType::parse(data),
        }
    }

    pub fn emit(&self) -> u8 {
        self.sar.emit() | self.message_type.emit()
    }
}

/// A single fragment as it travels over the data in/out characteristics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct ProxyPDU<'a> {
    pub header: Header,
    pub data: &'a [u8],
}

impl<'a> ProxyPDU<'a> {
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let (first, rest) = data.split_first()?;
        Some(Self {
            header: Header::parse(*first),
            data: rest,
        })
    }

    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        xmit.push(self.header.emit()).map_err(|_| InsufficientBuffer)?;
        xmit.extend_from_slice(self.data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        assert_eq!(
            Header::new(SAR::Complete, MessageType::NetworkPDU).emit(),
            0x00
        );
        assert_eq!(
            Header::new(SAR::First, MessageType::ProxyConfiguration).emit(),
            0x42
        );
        assert_eq!(
            Header::new(SAR::Continuation, MessageType::MeshBeacon).emit(),
            0x81
        );
        assert_eq!(
            Header::new(SAR::Last, MessageType::ProvisioningPDU).emit(),
            0xC3
        );
    }

    #[test]
    fn parse_unknown_type() {
        let header = Header::parse(0x7F);
        assert_eq!(header.sar, SAR::First);
        assert_eq!(header.message_type, MessageType::Other(0x3F));
        assert_eq!(header.emit(), 0x7F);
    }

    #[test]
    fn parse_fragment() {
        let pdu = ProxyPDU::parse(&[0xC2, 1, 2, 3]).unwrap();
        assert_eq!(pdu.header.sar, SAR::Last);
        assert_eq!(pdu.header.message_type, MessageType::ProxyConfiguration);
        assert_eq!(pdu.data, &[1, 2, 3]);
        assert!(ProxyPDU::parse(&[]).is_none());

        let mut xmit: Vec<u8, 4> = Vec::new();
        pdu.emit(&mut xmit).unwrap();
        assert_eq!(&xmit[..], &[0xC2, 1, 2, 3]);

        let mut small: Vec<u8, 3> = Vec::new();
        assert_eq!(pdu.emit(&mut small), Err(InsufficientBuffer));
    }
}
