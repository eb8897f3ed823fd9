use crate::pdu::{InsufficientBuffer, ParseError};
use heapless::Vec;

#[cfg(feature = "defmt")]
use defmt::Format;

pub const AD_FLAGS: u8 = 0x01;
pub const AD_UUID16_SOME: u8 = 0x02;
pub const AD_UUID16_ALL: u8 = 0x03;
pub const AD_NAME_COMPLETE: u8 = 0x09;
pub const AD_SVC_DATA16: u8 = 0x16;
pub const AD_URI: u8 = 0x24;
pub const AD_MESH_PROV: u8 = 0x29;
pub const AD_MESH_MESSAGE: u8 = 0x2A;
pub const AD_MESH_BEACON: u8 = 0x2B;

pub const FLAGS_GENERAL: u8 = 0x02;
pub const FLAGS_NO_BREDR: u8 = 0x04;

pub const MESH_PROVISIONING_UUID: u16 = 0x1827;
pub const MESH_PROXY_UUID: u16 = 0x1828;

/// Legacy advertising payload limit.
pub const MAX_AD_LEN: usize = 31;

pub type AdvertisingData = Vec<u8, MAX_AD_LEN>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct AdStructure<'a> {
    pub ad_type: u8,
    pub data: &'a [u8],
}

/// Walks the length-type-value structures of an advertising report.
///
/// Iteration stops at the first zero length field. A structure running past
/// the end of the report yields one error and ends the walk.
pub struct AdStructures<'a> {
    data: &'a [u8],
}

impl<'a> AdStructures<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for AdStructures<'a> {
    type Item = Result<AdStructure<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() <= 1 {
            return None;
        }
        let len = self.data[0] as usize;
        if len == 0 {
            self.data = &[];
            return None;
        }
        let rest = &self.data[1..];
        if len > rest.len() {
            self.data = &[];
            return Some(Err(ParseError::InvalidLength));
        }
        let structure = AdStructure {
            ad_type: rest[0],
            data: &rest[1..len],
        };
        self.data = &rest[len..];
        Some(Ok(structure))
    }
}

/// Identification type leading the Mesh Proxy service data.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum IdentificationType {
    NetworkId,
    NodeIdentity,
    PrivateNetworkIdentity,
    PrivateNodeIdentity,
}

impl IdentificationType {
    pub fn parse(data: u8) -> Result<Self, ParseError> {
        match data {
            0x00 => Ok(Self::NetworkId),
            0x01 => Ok(Self::NodeIdentity),
            0x02 => Ok(Self::PrivateNetworkIdentity),
            0x03 => Ok(Self::PrivateNodeIdentity),
            _ => Err(ParseError::InvalidValue),
        }
    }

    pub fn emit(&self) -> u8 {
        match self {
            Self::NetworkId => 0x00,
            Self::NodeIdentity => 0x01,
            Self::PrivateNetworkIdentity => 0x02,
            Self::PrivateNodeIdentity => 0x03,
        }
    }

    pub fn is_private(&self) -> bool {
        matches!(
            self,
            Self::PrivateNetworkIdentity | Self::PrivateNodeIdentity
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum ProxyServiceData {
    NetworkId([u8; 8]),
    Identity {
        kind: IdentificationType,
        hash: [u8; 8],
        random: [u8; 8],
    },
}

impl ProxyServiceData {
    pub fn identification_type(&self) -> IdentificationType {
        match self {
            Self::NetworkId(_) => IdentificationType::NetworkId,
            Self::Identity { kind, .. } => *kind,
        }
    }

    /// Parses the service data following the 16-bit service UUID.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let (kind, data) = data.split_first().ok_or(ParseError::InvalidLength)?;
        match IdentificationType::parse(*kind)? {
            IdentificationType::NetworkId => {
                let mut network_id = [0; 8];
                if data.len() != network_id.len() {
                    return Err(ParseError::InvalidLength);
                }
                network_id.copy_from_slice(data);
                Ok(Self::NetworkId(network_id))
            }
            kind => {
                if data.len() != 16 {
                    return Err(ParseError::InvalidLength);
                }
                let mut hash = [0; 8];
                let mut random = [0; 8];
                hash.copy_from_slice(&data[..8]);
                random.copy_from_slice(&data[8..]);
                Ok(Self::Identity { kind, hash, random })
            }
        }
    }

    /// Emits the complete service data, 16-bit UUID included.
    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        xmit.extend_from_slice(&MESH_PROXY_UUID.to_le_bytes())?;
        xmit.push(self.identification_type().emit())
            .map_err(|_| InsufficientBuffer)?;
        match self {
            Self::NetworkId(network_id) => xmit.extend_from_slice(network_id)?,
            Self::Identity { hash, random, .. } => {
                xmit.extend_from_slice(hash)?;
                xmit.extend_from_slice(random)?;
            }
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub struct ProvisioningServiceData {
    pub uuid: [u8; 16],
    pub oob_info: u16,
}

impl ProvisioningServiceData {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() != 18 {
            return Err(ParseError::InvalidLength);
        }
        let mut uuid = [0; 16];
        uuid.copy_from_slice(&data[..16]);
        Ok(Self {
            uuid,
            oob_info: u16::from_be_bytes([data[16], data[17]]),
        })
    }

    pub fn emit<const N: usize>(&self, xmit: &mut Vec<u8, N>) -> Result<(), InsufficientBuffer> {
        xmit.extend_from_slice(&MESH_PROVISIONING_UUID.to_le_bytes())?;
        xmit.extend_from_slice(&self.uuid)?;
        xmit.extend_from_slice(&self.oob_info.to_be_bytes())?;
        Ok(())
    }
}

/// Service data of a connectable mesh advertisement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(Format))]
pub enum MeshServiceData {
    Proxy(ProxyServiceData),
    Provisioning(ProvisioningServiceData),
}

impl MeshServiceData {
    /// Parses a 16-bit service data structure. `Ok(None)` is a foreign service.
    pub fn parse(data: &[u8]) -> Result<Option<Self>, ParseError> {
        if data.len() < 3 {
            return Err(ParseError::InvalidLength);
        }
        match u16::from_le_bytes([data[0], data[1]]) {
            MESH_PROXY_UUID => Ok(Some(Self::Proxy(ProxyServiceData::parse(&data[2..])?))),
            MESH_PROVISIONING_UUID => Ok(Some(Self::Provisioning(
                ProvisioningServiceData::parse(&data[2..])?,
            ))),
            _ => Ok(None),
        }
    }
}

fn push_structure<const N: usize>(
    xmit: &mut Vec<u8, N>,
    ad_type: u8,
    data: &[u8],
) -> Result<(), InsufficientBuffer> {
    xmit.push(data.len() as u8 + 1).map_err(|_| InsufficientBuffer)?;
    xmit.push(ad_type).map_err(|_| InsufficientBuffer)?;
    xmit.extend_from_slice(data)?;
    Ok(())
}

/// Builds flags, the complete 16-bit service list and the service data.
pub fn connectable_advertisement(
    service_uuid: u16,
    service_data: &[u8],
) -> Result<AdvertisingData, InsufficientBuffer> {
    let mut xmit = Vec::new();
    push_structure(&mut xmit, AD_FLAGS, &[FLAGS_GENERAL | FLAGS_NO_BREDR])?;
    push_structure(&mut xmit, AD_UUID16_ALL, &service_uuid.to_le_bytes())?;
    push_structure(&mut xmit, AD_SVC_DATA16, service_data)?;
    Ok(xmit)
}

pub fn proxy_advertisement(data: &ProxyServiceData) -> Result<AdvertisingData, InsufficientBuffer> {
    let mut service_data: Vec<u8, 19> = Vec::new();
    data.emit(&mut service_data)?;
    connectable_advertisement(MESH_PROXY_UUID, &service_data)
}

pub fn provisioning_advertisement(
    data: &ProvisioningServiceData,
) -> Result<AdvertisingData, InsufficientBuffer> {
    let mut service_data: Vec<u8, 20> = Vec::new();
    data.emit(&mut service_data)?;
    connectable_advertisement(MESH_PROVISIONING_UUID, &service_data)
}

/// Scan response carrying the device name and provisioning URI, when set.
pub fn scan_response(
    name: Option<&str>,
    uri: Option<&str>,
) -> Result<AdvertisingData, InsufficientBuffer> {
    let mut xmit = Vec::new();
    if let Some(name) = name {
        push_structure(&mut xmit, AD_NAME_COMPLETE, name.as_bytes())?;
    }
    if let Some(uri) = uri {
        push_structure(&mut xmit, AD_URI, uri.as_bytes())?;
    }
    Ok(xmit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walk_structures() {
        let data = [0x02, 0x01, 0x06, 0x03, 0x03, 0x28, 0x18, 0x00, 0xFF];
        let mut iter = AdStructures::new(&data);
        assert_eq!(
            iter.next(),
            Some(Ok(AdStructure {
                ad_type: AD_FLAGS,
                data: &[0x06]
            }))
        );
        assert_eq!(
            iter.next(),
            Some(Ok(AdStructure {
                ad_type: AD_UUID16_ALL,
                data: &[0x28, 0x18]
            }))
        );
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn truncated_structure() {
        let data = [0x02, 0x01, 0x06, 0x05, 0x16, 0x28];
        let mut iter = AdStructures::new(&data);
        assert!(matches!(iter.next(), Some(Ok(_))));
        assert_eq!(iter.next(), Some(Err(ParseError::InvalidLength)));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn network_id_advertisement() {
        let ad = proxy_advertisement(&ProxyServiceData::NetworkId([1, 2, 3, 4, 5, 6, 7, 8])).unwrap();
        assert_eq!(
            &ad[..],
            &[
                0x02, 0x01, 0x06, 0x03, 0x03, 0x28, 0x18, 0x0C, 0x16, 0x28, 0x18, 0x00, 1, 2, 3,
                4, 5, 6, 7, 8
            ]
        );
    }

    #[test]
    fn identity_service_data_length() {
        let data = ProxyServiceData::Identity {
            kind: IdentificationType::PrivateNodeIdentity,
            hash: [0xAA; 8],
            random: [0x55; 8],
        };
        let mut xmit: Vec<u8, 19> = Vec::new();
        data.emit(&mut xmit).unwrap();
        assert_eq!(xmit.len(), 19);
        assert_eq!(xmit[2], 0x03);
        assert_eq!(ProxyServiceData::parse(&xmit[2..]), Ok(data));
    }

    #[test]
    fn network_id_requires_exact_length() {
        assert_eq!(
            ProxyServiceData::parse(&[0x00, 1, 2, 3, 4, 5, 6, 7]),
            Err(ParseError::InvalidLength)
        );
        assert_eq!(
            ProxyServiceData::parse(&[0x04, 1, 2, 3, 4, 5, 6, 7, 8]),
            Err(ParseError::InvalidValue)
        );
    }

    #[test]
    fn provisioning_advertisement_layout() {
        let data = ProvisioningServiceData {
            uuid: [0x11; 16],
            oob_info: 0x0102,
        };
        let ad = provisioning_advertisement(&data).unwrap();
        assert_eq!(&ad[..11], &[0x02, 0x01, 0x06, 0x03, 0x03, 0x27, 0x18, 0x15, 0x16, 0x27, 0x18]);
        assert_eq!(&ad[27..], &[0x01, 0x02]);
        assert_eq!(
            MeshServiceData::parse(&ad[9..]),
            Ok(Some(MeshServiceData::Provisioning(data)))
        );
    }

    #[test]
    fn foreign_service() {
        assert_eq!(MeshServiceData::parse(&[0x0F, 0x18, 0x00]), Ok(None));
        assert_eq!(
            MeshServiceData::parse(&[0x28, 0x18]),
            Err(ParseError::InvalidLength)
        );
    }

    #[test]
    fn scan_response_fields() {
        let sd = scan_response(Some("mesh"), None).unwrap();
        assert_eq!(&sd[..], &[0x05, 0x09, b'm', b'e', b's', b'h']);
        assert!(scan_response(None, None).unwrap().is_empty());
        assert!(scan_response(Some("a-rather-long-device-name"), Some("https://example.com/x")).is_err());
    }
}
