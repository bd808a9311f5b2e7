//! Pure, side-effect-free conversion between envelopes and bytes.
//!
//! Forward-compatibility policy: unknown fields at the envelope level are
//! ignored on decode; `params`, `result`, and `error.data` payloads are
//! carried verbatim as JSON values, so unknown fields inside them are
//! preserved end to end. A message is never rejected solely for carrying
//! fields this client does not know about. The `jsonrpc` field is written
//! as `"2.0"` on encode and not enforced on decode.

use courier_core::{CourierError, CourierResult, ErrorObject};
use serde_json::{json, Map, Value};

use crate::envelope::{Envelope, Notification, Request, RequestId, Response};

/// Encodes an envelope to its wire-neutral byte form (compact JSON,
/// no framing).
pub fn encode(envelope: &Envelope) -> CourierResult<Vec<u8>> {
    let value = match envelope {
        Envelope::Request(req) => {
            let mut obj = json!({
                "jsonrpc": "2.0",
                "id": req.id,
                "method": req.method,
            });
            if let Some(params) = &req.params {
                obj["params"] = params.clone();
            }
            obj
        }
        Envelope::Response(resp) => {
            match (&resp.result, &resp.error) {
                (Some(_), Some(_)) => {
                    return Err(CourierError::Decode(
                        "response carries both result and error".into(),
                    ))
                }
                (None, None) => {
                    return Err(CourierError::Decode(
                        "response carries neither result nor error".into(),
                    ))
                }
                _ => {}
            }
            let mut obj = json!({
                "jsonrpc": "2.0",
                "id": resp.id,
            });
            if let Some(result) = &resp.result {
                obj["result"] = result.clone();
            }
            if let Some(error) = &resp.error {
                obj["error"] = serde_json::to_value(error)?;
            }
            obj
        }
        Envelope::Notification(n) => {
            let mut obj = json!({
                "jsonrpc": "2.0",
                "method": n.method,
            });
            if let Some(params) = &n.params {
                obj["params"] = params.clone();
            }
            obj
        }
    };
    Ok(serde_json::to_vec(&value)?)
}

/// Decodes one wire message into an envelope.
///
/// Classification follows the wire shape: `id` + `method` is a request,
/// `id` alone is a response, `method` alone is a notification. Anything
/// else is malformed.
pub fn decode(bytes: &[u8]) -> CourierResult<Envelope> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| CourierError::Decode(format!("invalid JSON: {e}")))?;
    let Value::Object(obj) = value else {
        return Err(CourierError::Decode("envelope must be a JSON object".into()));
    };

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(parse_id(raw)?),
    };
    let method = match obj.get("method") {
        None => None,
        Some(Value::String(m)) => Some(m.clone()),
        Some(_) => return Err(CourierError::Decode("method must be a string".into())),
    };

    match (id, method) {
        (Some(id), Some(method)) => Ok(Envelope::Request(Request {
            id,
            method,
            params: obj.get("params").cloned(),
        })),
        (Some(id), None) => decode_response(id, &obj),
        (None, Some(method)) => Ok(Envelope::Notification(Notification {
            method,
            params: obj.get("params").cloned(),
        })),
        (None, None) => Err(CourierError::Decode(
            "envelope is neither request, response, nor notification".into(),
        )),
    }
}

fn parse_id(raw: &Value) -> CourierResult<RequestId> {
    serde_json::from_value(raw.clone())
        .map_err(|_| CourierError::Decode(format!("id must be a string or integer, got {raw}")))
}

fn decode_response(id: RequestId, obj: &Map<String, Value>) -> CourierResult<Envelope> {
    let result = obj.get("result").cloned();
    let error = match obj.get("error") {
        None => None,
        Some(raw) => Some(
            serde_json::from_value::<ErrorObject>(raw.clone())
                .map_err(|e| CourierError::Decode(format!("malformed error object: {e}")))?,
        ),
    };
    match (&result, &error) {
        (Some(_), Some(_)) => Err(CourierError::Decode(
            "response carries both result and error".into(),
        )),
        (None, None) => Err(CourierError::Decode(
            "response carries neither result nor error".into(),
        )),
        _ => Ok(Envelope::Response(Response { id, result, error })),
    }
}
