//! Answers for the host's lemma verification suite
//!
//! Each test sends one event and expects a `<Name>Verify` reply.

use lemma::{EventValue, Lemma};
use serde_json::{json, Value};
use tracing::warn;

/// Connect every verification handler to `lemma`
pub fn install(lemma: &Lemma) {
    let sender = lemma.sender();
    lemma.connect_handler("Echo", move |_, value| {
        sender.send_message("EchoVerify", value);
    });

    let sender = lemma.sender();
    lemma.connect_handler("PlusOne", move |name, value| match plus_one(value) {
        Some(n) => sender.send_message("PlusOneVerify", n),
        None => warn!(event = %name, value = %value, "Expected an integer"),
    });

    let sender = lemma.sender();
    lemma.connect_handler("Sum", move |name, value| match sum(value) {
        Some(n) => sender.send_message("SumVerify", n),
        None => warn!(event = %name, value = %value, "Expected an integer array"),
    });

    let sender = lemma.sender();
    lemma.connect_handler("Name", move |name, value| match full_name(value) {
        Some(obj) => sender.send_message("NameVerify", obj),
        None => warn!(event = %name, value = %value, "Expected firstName and lastName"),
    });
}

/// Values arrive either as JSON or as JSON text inside a string
fn as_json(value: &EventValue) -> Option<Value> {
    match value {
        EventValue::String(s) => serde_json::from_str(s).ok(),
        other => Some(other.to_json()),
    }
}

pub fn plus_one(value: &EventValue) -> Option<i64> {
    value.as_text().trim().parse::<i64>().ok()?.checked_add(1)
}

pub fn sum(value: &EventValue) -> Option<i64> {
    as_json(value)?
        .as_array()?
        .iter()
        .try_fold(0i64, |acc, item| acc.checked_add(item.as_i64()?))
}

pub fn full_name(value: &EventValue) -> Option<Value> {
    let obj = as_json(value)?;
    let first = obj.get("firstName")?.as_str()?;
    let last = obj.get("lastName")?.as_str()?;
    Some(json!({ "fullName": format!("{first} {last}") }))
}
