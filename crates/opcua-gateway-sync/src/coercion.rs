//! Conversions between control values and protocol scalars.

use opcua_gateway_core::address_space::{AccessLevel, DataType, DataValue, Variant};
use opcua_gateway_core::bus::ControlHandle;
use opcua_gateway_core::value::ControlValue;

use crate::error::CoercionError;

/// Declared data type and access level for a new variable node.
///
/// The data type follows the control's current value. If the value cannot be
/// fetched the node falls back to `BaseDataType` and read-only access.
pub fn declare_type(control: &ControlHandle) -> (DataType, AccessLevel) {
    let data_type = match control.value() {
        Ok(ControlValue::Boolean(_)) => DataType::Boolean,
        Ok(ControlValue::Number(_)) => DataType::Double,
        Ok(ControlValue::Text(_)) => DataType::BaseDataType,
        Err(e) => {
            tracing::error!(
                device = control.device_id(),
                control = control.id(),
                error = %e,
                "Can't get data type, fallback to BaseDataType"
            );
            return (DataType::BaseDataType, AccessLevel::READ);
        }
    };

    let access_level = if control.is_readonly() {
        AccessLevel::READ
    } else {
        AccessLevel::READ_WRITE
    };
    (data_type, access_level)
}

pub fn encode(value: &ControlValue) -> Variant {
    match value {
        ControlValue::Boolean(v) => Variant::Boolean(*v),
        ControlValue::Number(v) => Variant::Double(*v),
        ControlValue::Text(v) => Variant::String(v.clone()),
    }
}

/// Accepts only Boolean, Double and String scalars.
pub fn decode(variant: &Variant) -> Result<ControlValue, CoercionError> {
    match variant {
        Variant::Boolean(v) => Ok(ControlValue::Boolean(*v)),
        Variant::Double(v) => Ok(ControlValue::Number(*v)),
        Variant::String(v) => Ok(ControlValue::Text(v.clone())),
        other => Err(CoercionError::UnknownDataType(other.type_name())),
    }
}

/// Decode the payload of a client-supplied data value.
pub fn decode_data_value(value: &DataValue) -> Result<ControlValue, CoercionError> {
    value.value.as_ref().ok_or(CoercionError::Empty).and_then(decode)
}
