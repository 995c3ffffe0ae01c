//! Conversion of an extension resource into a `TypedExtensionConfig`.
//!
//! Published resources use the protobuf JSON mapping: `Any` values carry
//! their type URL in `@type` next to the message fields.

use crate::CoreError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tracing::warn;
use wasmxds_schema::ExtensionResource;

pub const TYPED_EXTENSION_CONFIG_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.core.v3.TypedExtensionConfig";
pub const WASM_FILTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.wasm.v3.Wasm";
pub const STRING_VALUE_TYPE_URL: &str = "type.googleapis.com/google.protobuf.StringValue";

/// A packed message: its type URL plus the message's own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Any {
    #[serde(rename = "@type")]
    pub type_url: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Any {
    pub fn pack<T: Serialize>(type_url: &str, message: &T) -> Result<Self, serde_json::Error> {
        match serde_json::to_value(message)? {
            serde_json::Value::Object(fields) => Ok(Self {
                type_url: type_url.to_owned(),
                fields,
            }),
            other => Err(serde::ser::Error::custom(format!(
                "{type_url} must serialize to an object, got {other}"
            ))),
        }
    }

    pub fn unpack<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(self.fields.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringValue {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedExtensionConfig {
    /// `namespace/name` of the source resource.
    pub name: String,
    pub typed_config: Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WasmFilter {
    pub config: PluginConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub root_id: String,
    pub vm_config: VmConfig,
    pub configuration: Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmConfig {
    pub vm_id: String,
    pub runtime: String,
    pub code: AsyncDataSource,
    pub configuration: Any,
    pub allow_precompiled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncDataSource {
    pub local: DataSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    /// Base64, as in the protobuf JSON mapping of `bytes`.
    pub inline_bytes: String,
}

impl DataSource {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.inline_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuntimeEngine {
    #[default]
    V8,
    Wavm,
    Wasmtime,
}

impl RuntimeEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            RuntimeEngine::V8 => "envoy.wasm.runtime.v8",
            RuntimeEngine::Wavm => "envoy.wasm.runtime.wavm",
            RuntimeEngine::Wasmtime => "envoy.wasm.runtime.wasmtime",
        }
    }
}

/// Map a declared runtime to an engine, case-insensitively.
///
/// Unknown names fall back to the default engine; the second element then
/// carries the warning that was logged.
pub fn select_runtime(declared: &str) -> (RuntimeEngine, Option<String>) {
    match declared.to_ascii_lowercase().as_str() {
        "" | "v8" => (RuntimeEngine::V8, None),
        "wavm" => (RuntimeEngine::Wavm, None),
        "wasmtime" => (RuntimeEngine::Wasmtime, None),
        _ => {
            let message = format!("unknown runtime '{declared}', falling back to v8");
            warn!("{message}");
            (RuntimeEngine::default(), Some(message))
        }
    }
}

/// A converted resource and the runtime decision behind it.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    pub config: TypedExtensionConfig,
    pub runtime: RuntimeEngine,
    pub runtime_warning: Option<String>,
}

pub fn convert(
    resource: &ExtensionResource,
    binary: &[u8],
    plugin_config: &str,
    vm_config: &str,
) -> Result<Conversion, CoreError> {
    let failed = |what: &str, e: serde_json::Error| {
        CoreError::ConversionFailed(format!("marshal {what} failed: {e}"))
    };

    let plugin_configuration = Any::pack(
        STRING_VALUE_TYPE_URL,
        &StringValue {
            value: plugin_config.to_owned(),
        },
    )
    .map_err(|e| failed("plugin configuration", e))?;
    let vm_configuration = Any::pack(
        STRING_VALUE_TYPE_URL,
        &StringValue {
            value: vm_config.to_owned(),
        },
    )
    .map_err(|e| failed("vm configuration", e))?;

    let (runtime, runtime_warning) = select_runtime(&resource.spec.runtime);
    let filter = WasmFilter {
        config: PluginConfig {
            root_id: resource.spec.root_id.clone(),
            vm_config: VmConfig {
                vm_id: resource.spec.vm_id.clone(),
                runtime: runtime.as_str().to_owned(),
                code: AsyncDataSource {
                    local: DataSource {
                        inline_bytes: STANDARD.encode(binary),
                    },
                },
                configuration: vm_configuration,
                allow_precompiled: true,
            },
            configuration: plugin_configuration,
        },
    };
    let typed_config =
        Any::pack(WASM_FILTER_TYPE_URL, &filter).map_err(|e| failed("wasm filter", e))?;

    Ok(Conversion {
        config: TypedExtensionConfig {
            name: resource.identity().to_string(),
            typed_config,
        },
        runtime,
        runtime_warning,
    })
}
