use alloy::dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy::primitives::{Address, B256};
use std::collections::BTreeMap;
use web3scan_common::ScanError;

use crate::abi::InterfaceDefinition;
use crate::types::{ArgValue, DecodedEvent, RawLog};

/// Decode a raw log against the contract's interface.
///
/// Indexed parameters take the topic slots after the signature in declaration
/// order. Indexed reference types (`string`, `bytes`, arrays, tuples) only
/// carry their keccak hash on chain and decode as 32 fixed bytes. The remaining
/// parameters are decoded from the data payload in one sequence decode.
///
/// Fails with [`ScanError::UnknownEventKind`] when topic 0 does not match any
/// event of the interface. The caller decides whether that is fatal.
pub fn decode_log(
    contract: Address,
    interface: &InterfaceDefinition,
    log: &RawLog,
) -> Result<DecodedEvent, ScanError> {
    let signature = log
        .topics
        .first()
        .ok_or_else(|| ScanError::UnknownEventKind("log has no signature topic".to_string()))?;

    let event = interface
        .event_by_topic(signature)
        .ok_or_else(|| ScanError::UnknownEventKind(format!("{:?}", signature)))?;

    let mut args = BTreeMap::new();
    let mut topics = log.topics[1..].iter();
    let mut body_names = Vec::new();
    let mut body_types = Vec::new();

    for (position, param) in event.inputs.iter().enumerate() {
        let name = if param.name.is_empty() {
            format!("arg{}", position)
        } else {
            param.name.clone()
        };

        let ty: DynSolType = param.resolve().map_err(|e| {
            ScanError::ArgumentDecode(format!(
                "{}: unsupported type '{}' for '{}': {}",
                event.name, param.ty, name, e
            ))
        })?;

        if param.indexed {
            let topic = topics.next().ok_or_else(|| {
                ScanError::ArgumentDecode(format!(
                    "{}: missing topic for indexed parameter '{}'",
                    event.name, name
                ))
            })?;
            let value = decode_topic(&ty, topic).map_err(|e| {
                ScanError::ArgumentDecode(format!("{}: topic for '{}': {}", event.name, name, e))
            })?;
            insert_arg(&mut args, &event.name, name, value.into())?;
        } else {
            body_names.push(name);
            body_types.push(ty);
        }
    }

    if topics.next().is_some() {
        let indexed = event.inputs.iter().filter(|param| param.indexed).count();
        return Err(ScanError::ArgumentDecode(format!(
            "{}: expected {} topics, got {}",
            event.name,
            indexed + 1,
            log.topics.len()
        )));
    }

    if !body_types.is_empty() {
        let expected = body_types.len();
        let decoded = DynSolType::Tuple(body_types)
            .abi_decode_sequence(&log.data)
            .map_err(|e| ScanError::ArgumentDecode(format!("{}: {}", event.name, e)))?;

        let values = match decoded {
            DynSolValue::Tuple(values) => values,
            other => vec![other],
        };

        if values.len() != expected {
            return Err(ScanError::ArgumentDecode(format!(
                "{}: expected {} data values, got {}",
                event.name,
                expected,
                values.len()
            )));
        }

        for (name, value) in body_names.into_iter().zip(values) {
            insert_arg(&mut args, &event.name, name, value.into())?;
        }
    }

    Ok(DecodedEvent {
        contract,
        event: event.name.clone(),
        block_number: log.block_number,
        transaction_hash: log.transaction_hash,
        log_index: log.log_index,
        args,
    })
}

/// Value types are stored in the topic word itself. Everything else
/// (`string`, `bytes`, arrays, tuples) is stored as its keccak hash.
fn decode_topic(ty: &DynSolType, topic: &B256) -> Result<DynSolValue, alloy::dyn_abi::Error> {
    match ty {
        DynSolType::Bool
        | DynSolType::Int(_)
        | DynSolType::Uint(_)
        | DynSolType::FixedBytes(_)
        | DynSolType::Address
        | DynSolType::Function => ty.abi_decode(topic.as_slice()),
        _ => Ok(DynSolValue::FixedBytes(*topic, 32)),
    }
}

fn insert_arg(
    args: &mut BTreeMap<String, ArgValue>,
    event: &str,
    name: String,
    value: ArgValue,
) -> Result<(), ScanError> {
    if args.contains_key(&name) {
        return Err(ScanError::ArgumentDecode(format!(
            "{}: duplicate parameter name '{}'",
            event, name
        )));
    }
    args.insert(name, value);
    Ok(())
}
