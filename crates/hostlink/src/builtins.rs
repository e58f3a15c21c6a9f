//! Capabilities every host is expected to have: `console` and `crypto`.
//!
//! They are only installed when the embedder did not register its own.

use rand::RngCore;

use crate::env::{EnvironmentConfig, HostEnvironment};
use crate::value::{HostValue, PlainObject, Thrown};

/// Largest buffer `getRandomValues` fills in one call.
pub const MAX_RANDOM_BYTES: usize = 65536;

pub(crate) fn install(host: &mut HostEnvironment, config: &EnvironmentConfig) {
    if !host.contains("console") {
        host.insert("console", console());
    }

    let crypto_present = match config.probes.get("crypto") {
        Some(candidates) => candidates.iter().any(|c| host.contains(c)),
        None => host.contains("crypto"),
    };
    if !crypto_present {
        host.insert("crypto", crypto());
    }
}

/// Join console arguments the way a host console prints them.
pub fn format_console_args(args: &[HostValue]) -> String {
    args.iter()
        .map(|arg| match arg {
            HostValue::String(s) => s.clone(),
            other => other.debug_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `console` forwarding to `tracing` under the `hostlink::console` target.
pub fn console() -> HostValue {
    HostValue::object(
        PlainObject::with_class("console")
            .method("log", |_, args| {
                tracing::info!(target: "hostlink::console", "{}", format_console_args(args));
                Ok(HostValue::Undefined)
            })
            .method("info", |_, args| {
                tracing::info!(target: "hostlink::console", "{}", format_console_args(args));
                Ok(HostValue::Undefined)
            })
            .method("debug", |_, args| {
                tracing::debug!(target: "hostlink::console", "{}", format_console_args(args));
                Ok(HostValue::Undefined)
            })
            .method("warn", |_, args| {
                tracing::warn!(target: "hostlink::console", "{}", format_console_args(args));
                Ok(HostValue::Undefined)
            })
            .method("error", |_, args| {
                tracing::error!(target: "hostlink::console", "{}", format_console_args(args));
                Ok(HostValue::Undefined)
            }),
    )
}

/// `crypto` with `getRandomValues`.
pub fn crypto() -> HostValue {
    HostValue::object(
        PlainObject::with_class("Crypto").method("getRandomValues", |_, args| {
            get_random_values(args.first().cloned().unwrap_or_default())
        }),
    )
}

/// Fill an integer typed array with random bytes and return it.
pub fn get_random_values(target: HostValue) -> Result<HostValue, Thrown> {
    let Some(array) = target.as_array() else {
        return Err(Thrown::type_error(
            "Crypto.getRandomValues: argument is not a typed array",
        ));
    };
    if matches!(
        array.kind(),
        crate::memory::ViewKind::Float32 | crate::memory::ViewKind::Float64
    ) {
        return Err(Thrown::error(
            "TypeMismatchError",
            "Crypto.getRandomValues: float arrays are not supported",
        ));
    }
    let byte_len = array.len() * array.kind().width();
    if byte_len > MAX_RANDOM_BYTES {
        return Err(Thrown::error(
            "QuotaExceededError",
            format!("Crypto.getRandomValues: {byte_len} bytes exceeds {MAX_RANDOM_BYTES}"),
        ));
    }
    array.with_bytes_mut(|bytes| rand::thread_rng().fill_bytes(bytes));
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ViewKind;
    use crate::value::TypedArray;

    #[test]
    fn test_console_formatting() {
        let args = [
            HostValue::from("frame"),
            HostValue::Number(3.0),
            HostValue::Bool(true),
            HostValue::Undefined,
        ];
        assert_eq!(format_console_args(&args), "frame 3 true undefined");
    }

    #[test]
    fn test_random_values_fill_in_place() {
        let array = TypedArray::zeroed(ViewKind::Uint8, 256);
        let returned = get_random_values(HostValue::Array(array.clone())).unwrap();
        assert_eq!(returned, HostValue::Array(array.clone()));
        // 256 zero bytes from a CSPRNG is not going to happen
        assert!(array.to_bytes().iter().any(|b| *b != 0));
    }

    #[test]
    fn test_random_values_rejects_bad_input() {
        assert!(get_random_values(HostValue::Number(1.0)).is_err());
        let floats = TypedArray::zeroed(ViewKind::Float64, 4);
        assert!(get_random_values(HostValue::Array(floats)).is_err());
        let big = TypedArray::zeroed(ViewKind::Uint32, MAX_RANDOM_BYTES / 4 + 1);
        let err = get_random_values(HostValue::Array(big)).unwrap_err();
        assert!(err.to_string().starts_with("QuotaExceededError"));
    }
}
