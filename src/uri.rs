// SPDX-License-Identifier: MIT OR Apache-2.0

//! Controller-selection URIs (spec §6): `usb://`, `usb://<serial>`,
//! `usb://@<index>`, `eth://<host>`, `udp://<host>`, or a bare hostname.

use crate::error::ConfigurationError;
use crate::transport::usb::UsbSelector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerUri {
    Usb(UsbSelectorOwned),
    Eth(String),
}

/// Mirrors [`UsbSelector`] with `PartialEq`/`Eq` for URI round-trip tests;
/// [`UsbSelector`] itself stays lean for transport construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsbSelectorOwned {
    First,
    Serial(String),
    Index(usize),
}

impl From<UsbSelectorOwned> for UsbSelector {
    fn from(s: UsbSelectorOwned) -> Self {
        match s {
            UsbSelectorOwned::First => UsbSelector::First,
            UsbSelectorOwned::Serial(s) => UsbSelector::Serial(s),
            UsbSelectorOwned::Index(i) => UsbSelector::Index(i),
        }
    }
}

pub fn parse_uri(s: &str) -> Result<ControllerUri, ConfigurationError> {
    if let Some(rest) = s.strip_prefix("usb://") {
        if rest.is_empty() {
            return Ok(ControllerUri::Usb(UsbSelectorOwned::First));
        }
        if let Some(idx) = rest.strip_prefix('@') {
            let n: usize = idx
                .parse()
                .map_err(|_| ConfigurationError::InvalidUri(s.to_string()))?;
            return Ok(ControllerUri::Usb(UsbSelectorOwned::Index(n)));
        }
        return Ok(ControllerUri::Usb(UsbSelectorOwned::Serial(rest.to_string())));
    }
    if let Some(host) = s.strip_prefix("eth://") {
        if host.is_empty() {
            return Err(ConfigurationError::InvalidUri(s.to_string()));
        }
        return Ok(ControllerUri::Eth(host.to_string()));
    }
    if let Some(host) = s.strip_prefix("udp://") {
        if host.is_empty() {
            return Err(ConfigurationError::InvalidUri(s.to_string()));
        }
        return Ok(ControllerUri::Eth(host.to_string()));
    }
    if let Some(idx) = s.find("://") {
        return Err(ConfigurationError::UnknownUriScheme(s[..idx].to_string()));
    }
    if s.is_empty() {
        return Err(ConfigurationError::InvalidUri(s.to_string()));
    }
    Ok(ControllerUri::Eth(s.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_first_device() {
        assert_eq!(parse_uri("usb://").unwrap(), ControllerUri::Usb(UsbSelectorOwned::First));
    }

    #[test]
    fn usb_by_serial() {
        assert_eq!(
            parse_uri("usb://ABC123").unwrap(),
            ControllerUri::Usb(UsbSelectorOwned::Serial("ABC123".into()))
        );
    }

    #[test]
    fn usb_by_index() {
        assert_eq!(
            parse_uri("usb://@2").unwrap(),
            ControllerUri::Usb(UsbSelectorOwned::Index(2))
        );
    }

    #[test]
    fn eth_and_udp_schemes() {
        assert_eq!(parse_uri("eth://192.168.0.1").unwrap(), ControllerUri::Eth("192.168.0.1".into()));
        assert_eq!(parse_uri("udp://mvlc-1").unwrap(), ControllerUri::Eth("mvlc-1".into()));
    }

    #[test]
    fn bare_hostname_is_eth() {
        assert_eq!(parse_uri("mvlc-1.local").unwrap(), ControllerUri::Eth("mvlc-1.local".into()));
    }

    #[test]
    fn unknown_scheme_rejected() {
        assert!(matches!(
            parse_uri("ftp://host"),
            Err(ConfigurationError::UnknownUriScheme(s)) if s == "ftp"
        ));
    }

    #[test]
    fn empty_string_rejected() {
        assert!(parse_uri("").is_err());
    }
}
