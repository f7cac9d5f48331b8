//! `FilterEngine` backed by the Windows Filtering Platform.
//!
//! Each call opens a short-lived, non-dynamic engine session, so filters
//! outlive the session that added them and are removed only by key. The
//! gateway sublayer is registered once when the engine is created.

use super::filter_engine::{FilterAction, FilterEngine, FilterSpec, SUBLAYER_KEY};
use crate::term::Protocol;
use spa_core::{SpaError, SpaResult};
use std::net::IpAddr;
use tracing::debug;
use uuid::Uuid;
use windows::core::{GUID, PCWSTR, PWSTR};
use windows::Win32::Foundation::HANDLE;
use windows::Win32::NetworkManagement::WindowsFilteringPlatform::*;
use windows::Win32::Security::PSECURITY_DESCRIPTOR;
use windows::Win32::System::Rpc::RPC_C_AUTHN_WINNT;

const FWP_E_FILTER_NOT_FOUND: u32 = 0x8032_0003;
const FWP_E_ALREADY_EXISTS: u32 = 0x8032_0009;

const SUBLAYER_NAME: &str = "spa-gateway";
const SUBLAYER_WEIGHT: u16 = 0x0f00;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

fn guid(id: &Uuid) -> GUID {
    GUID::from_u128(id.as_u128())
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

fn check(op: &str, status: u32) -> SpaResult<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(SpaError::Firewall(format!("{op} failed: 0x{status:08x}")))
    }
}

/// An open engine handle, closed on drop.
struct Session(HANDLE);

impl Session {
    fn open() -> SpaResult<Self> {
        let mut handle = HANDLE::default();
        // SAFETY: `handle` is a valid out-pointer; null server name and
        // session select the local engine with default options.
        let status = unsafe {
            FwpmEngineOpen0(
                PCWSTR::null(),
                RPC_C_AUTHN_WINNT as u32,
                None,
                None,
                &mut handle,
            )
        };
        check("FwpmEngineOpen0", status)?;
        Ok(Self(handle))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // SAFETY: the handle came from a successful FwpmEngineOpen0.
        let status = unsafe { FwpmEngineClose0(self.0) };
        if status != 0 {
            debug!(status, "FwpmEngineClose0 failed");
        }
    }
}

/// The Windows Filtering Platform engine.
pub struct WfpEngine;

impl WfpEngine {
    /// Connect to the local engine and make sure the gateway sublayer exists.
    pub fn new() -> SpaResult<Self> {
        let session = Session::open()?;
        let mut name = wide(SUBLAYER_NAME);
        let sublayer = FWPM_SUBLAYER0 {
            subLayerKey: guid(&SUBLAYER_KEY),
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR(name.as_mut_ptr()),
                description: PWSTR(name.as_mut_ptr()),
            },
            weight: SUBLAYER_WEIGHT,
            ..Default::default()
        };
        // SAFETY: `sublayer` and the strings it points to outlive the call.
        let status =
            unsafe { FwpmSubLayerAdd0(session.0, &sublayer, PSECURITY_DESCRIPTOR::default()) };
        if status != FWP_E_ALREADY_EXISTS {
            check("FwpmSubLayerAdd0", status)?;
        }
        Ok(Self)
    }
}

impl FilterEngine for WfpEngine {
    fn name(&self) -> &'static str {
        "wfp"
    }

    fn add_filter(&self, filter: &FilterSpec) -> SpaResult<()> {
        let session = Session::open()?;

        let mut name = wide(&filter.name);
        let mut description = wide(&filter.description);

        let (layer, mut address) = match filter.remote_address {
            IpAddr::V4(v4) => (
                FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V4,
                RemoteAddress::V4(u32::from(v4)),
            ),
            IpAddr::V6(v6) => (
                FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V6,
                RemoteAddress::V6(FWP_BYTE_ARRAY16 {
                    byteArray16: v6.octets(),
                }),
            ),
        };

        let mut conditions = [
            FWPM_FILTER_CONDITION0 {
                fieldKey: FWPM_CONDITION_IP_REMOTE_ADDRESS,
                matchType: FWP_MATCH_EQUAL,
                conditionValue: address.condition_value(),
            },
            FWPM_FILTER_CONDITION0 {
                fieldKey: FWPM_CONDITION_IP_LOCAL_PORT,
                matchType: FWP_MATCH_EQUAL,
                conditionValue: FWP_CONDITION_VALUE0 {
                    r#type: FWP_UINT16,
                    Anonymous: FWP_CONDITION_VALUE0_0 {
                        uint16: filter.local_port,
                    },
                },
            },
            FWPM_FILTER_CONDITION0 {
                fieldKey: FWPM_CONDITION_IP_PROTOCOL,
                matchType: FWP_MATCH_EQUAL,
                conditionValue: FWP_CONDITION_VALUE0 {
                    r#type: FWP_UINT8,
                    Anonymous: FWP_CONDITION_VALUE0_0 {
                        uint8: match filter.protocol {
                            Protocol::Tcp => IPPROTO_TCP,
                            Protocol::Udp => IPPROTO_UDP,
                        },
                    },
                },
            },
        ];

        let action_type = match filter.action {
            FilterAction::Permit => FWP_ACTION_PERMIT,
        };

        let native = FWPM_FILTER0 {
            filterKey: guid(&filter.key),
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR(name.as_mut_ptr()),
                description: PWSTR(description.as_mut_ptr()),
            },
            layerKey: layer,
            subLayerKey: guid(&filter.sublayer),
            weight: FWP_VALUE0 {
                r#type: FWP_UINT8,
                Anonymous: FWP_VALUE0_0 {
                    uint8: filter.weight,
                },
            },
            numFilterConditions: conditions.len() as u32,
            filterCondition: conditions.as_mut_ptr(),
            action: FWPM_ACTION0 {
                r#type: action_type,
                ..Default::default()
            },
            ..Default::default()
        };

        // SAFETY: `native` and everything it points to (names, conditions,
        // the IPv6 byte array) live until the call returns.
        let status = unsafe {
            FwpmFilterAdd0(session.0, &native, PSECURITY_DESCRIPTOR::default(), None)
        };
        check("FwpmFilterAdd0", status)
    }

    fn delete_filter(&self, key: &Uuid) -> SpaResult<bool> {
        let session = Session::open()?;
        let key = guid(key);
        // SAFETY: `key` lives for the duration of the call.
        let status = unsafe { FwpmFilterDeleteByKey0(session.0, &key) };
        match status {
            0 => Ok(true),
            FWP_E_FILTER_NOT_FOUND => Ok(false),
            other => check("FwpmFilterDeleteByKey0", other).map(|_| false),
        }
    }
}

/// Storage for the remote-address condition value; the IPv6 form is
/// passed by pointer and must stay put until the filter is added.
enum RemoteAddress {
    V4(u32),
    V6(FWP_BYTE_ARRAY16),
}

impl RemoteAddress {
    fn condition_value(&mut self) -> FWP_CONDITION_VALUE0 {
        match self {
            Self::V4(addr) => FWP_CONDITION_VALUE0 {
                r#type: FWP_UINT32,
                Anonymous: FWP_CONDITION_VALUE0_0 { uint32: *addr },
            },
            Self::V6(bytes) => FWP_CONDITION_VALUE0 {
                r#type: FWP_BYTE_ARRAY16_TYPE,
                Anonymous: FWP_CONDITION_VALUE0_0 {
                    byteArray16: bytes as *mut FWP_BYTE_ARRAY16,
                },
            },
        }
    }
}
