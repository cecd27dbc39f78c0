/* Generated hook classes.
 *
 * The stub pool is built straight from symbolic definitions and merged into the
 * primary classes.dex. `Hooks` holds one static stub per redirected framework
 * method, `HookConfig` carries the spoofed identity as static final strings and
 * `IdentityReceiver` answers identity refresh broadcasts.
 */

use crate::dex::pool::{
    AccessFlags, ClassDef, DexPool, FieldDef, FieldRef, InsnRef, Instruction, MethodBody,
    MethodDef, MethodProto, MethodRef, Value,
};
use crate::hook::{CONFIG_CLASS, HOOK_CLASS, RECEIVER_CLASS};

const OBJECT: &str = "Ljava/lang/Object;";
const STRING: &str = "Ljava/lang/String;";
const RECEIVER_SUPER: &str = "Landroid/content/BroadcastReceiver;";

fn const_string(register: u8, value: &str) -> Instruction {
    Instruction {
        units: vec![0x001a | ((register as u16) << 8), 0],
        reference: InsnRef::String(value.to_string()),
    }
}

/// invoke-static {v0}, `target` (35c form with a single argument).
fn invoke_static_v0(target: MethodRef) -> Instruction {
    Instruction {
        units: vec![0x1071, 0, 0x0000],
        reference: InsnRef::Method(target),
    }
}

fn move_result_object(register: u8) -> Instruction {
    Instruction::from_units(vec![0x000c | ((register as u16) << 8)])
}

fn return_object(register: u8) -> Instruction {
    Instruction::from_units(vec![0x0011 | ((register as u16) << 8)])
}

fn return_void() -> Instruction {
    Instruction::from_units(vec![0x000e])
}

fn sget_object(register: u8, field: FieldRef) -> Instruction {
    Instruction {
        units: vec![0x0062 | ((register as u16) << 8), 0],
        reference: InsnRef::Field(field),
    }
}

fn static_string_field(name: &str, value: &str) -> FieldDef {
    FieldDef {
        name: name.to_string(),
        descriptor: STRING.to_string(),
        access_flags: AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::FINAL,
        initial_value: Some(Value::String(value.to_string())),
        annotations: vec![],
    }
}

fn static_method(name: &str, proto: MethodProto, body: MethodBody) -> MethodDef {
    MethodDef {
        name: name.to_string(),
        proto,
        access_flags: AccessFlags::PUBLIC | AccessFlags::STATIC,
        body: Some(body),
        annotations: vec![],
        parameter_annotations: vec![],
    }
}

fn config_class(identity_json: &str, clone_package: &str) -> ClassDef {
    let mut class = ClassDef::new(
        CONFIG_CLASS,
        AccessFlags::PUBLIC | AccessFlags::FINAL,
        OBJECT,
    );
    class.static_fields.push(static_string_field("IDENTITY_JSON", identity_json));
    class.static_fields.push(static_string_field("CLONE_PACKAGE", clone_package));

    // value(String) hands the payload to the runtime side of the stubs, which
    // picks the requested key out of the JSON itself.
    let identity_field = FieldRef::new(CONFIG_CLASS, "IDENTITY_JSON", STRING);
    class.direct_methods.push(static_method(
        "value",
        MethodProto::new(STRING, &[STRING]),
        MethodBody {
            registers: 2,
            ins: 1,
            outs: 0,
            instructions: vec![sget_object(0, identity_field), return_object(0)],
            tries: vec![],
            debug_info: None,
        },
    ));
    class
}

/// A spoof stub: loads its payload key, asks `HookConfig.value` and returns
/// the result. The hooked receiver (and any original arguments) arrive in the
/// parameter registers and are ignored.
fn spoof_stub(name: &str, key: &str, parameters: &[&str]) -> MethodDef {
    let ins = parameters.len() as u16;
    let value_ref = MethodRef::new(CONFIG_CLASS, "value", MethodProto::new(STRING, &[STRING]));
    static_method(
        name,
        MethodProto::new(STRING, parameters),
        MethodBody {
            registers: 1 + ins,
            ins,
            outs: 1,
            instructions: vec![
                const_string(0, key),
                invoke_static_v0(value_ref),
                move_result_object(0),
                return_object(0),
            ],
            tries: vec![],
            debug_info: None,
        },
    )
}

fn hooks_class() -> ClassDef {
    let mut class = ClassDef::new(HOOK_CLASS, AccessFlags::PUBLIC | AccessFlags::FINAL, OBJECT);
    class.direct_methods.push(spoof_stub(
        "spoofSettingSecure",
        "android_id",
        &["Landroid/content/ContentResolver;", STRING],
    ));
    class.direct_methods.push(spoof_stub("spoofImei", "imei", &["Landroid/telephony/TelephonyManager;"]));
    class.direct_methods.push(spoof_stub("spoofImsi", "imsi", &["Landroid/telephony/TelephonyManager;"]));
    class.direct_methods.push(spoof_stub("spoofWifiMac", "wifi_mac", &["Landroid/net/wifi/WifiInfo;"]));
    class.direct_methods.push(spoof_stub("spoofSsid", "ssid", &["Landroid/net/wifi/WifiInfo;"]));
    class.direct_methods.push(spoof_stub("spoofUserAgent", "user_agent", &["Landroid/webkit/WebSettings;"]));
    class
}

fn receiver_class() -> ClassDef {
    let mut class = ClassDef::new(RECEIVER_CLASS, AccessFlags::PUBLIC, RECEIVER_SUPER);

    let super_init = MethodRef::new(RECEIVER_SUPER, "<init>", MethodProto::new("V", &[]));
    class.direct_methods.push(MethodDef {
        name: "<init>".to_string(),
        proto: MethodProto::new("V", &[]),
        access_flags: AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR,
        body: Some(MethodBody {
            registers: 1,
            ins: 1,
            outs: 1,
            instructions: vec![
                Instruction {
                    // invoke-direct {v0}, super.<init>()
                    units: vec![0x1070, 0, 0x0000],
                    reference: InsnRef::Method(super_init),
                },
                return_void(),
            ],
            tries: vec![],
            debug_info: None,
        }),
        annotations: vec![],
        parameter_annotations: vec![],
    });

    class.virtual_methods.push(MethodDef {
        name: "onReceive".to_string(),
        proto: MethodProto::new("V", &["Landroid/content/Context;", "Landroid/content/Intent;"]),
        access_flags: AccessFlags::PUBLIC,
        body: Some(MethodBody {
            registers: 3,
            ins: 3,
            outs: 0,
            instructions: vec![return_void()],
            tries: vec![],
            debug_info: None,
        }),
        annotations: vec![],
        parameter_annotations: vec![],
    });
    class
}

/// Builds the pool of generated classes for one clone.
pub fn stub_pool(identity_json: &str, clone_package: &str) -> DexPool {
    DexPool {
        classes: vec![
            config_class(identity_json, clone_package),
            hooks_class(),
            receiver_class(),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_contains_all_hook_classes() {
        let pool = stub_pool("{}", "com.app.clone1");
        assert!(pool.class(CONFIG_CLASS).is_some());
        assert!(pool.class(HOOK_CLASS).is_some());
        assert!(pool.class(RECEIVER_CLASS).is_some());
    }

    #[test]
    fn config_carries_payload_as_static_values() {
        let pool = stub_pool(r#"{"imei":"000000000000000"}"#, "com.app.clone1");
        let config = pool.class(CONFIG_CLASS).unwrap();
        let json = config.static_fields.iter().find(|f| f.name == "IDENTITY_JSON").unwrap();
        assert_eq!(
            json.initial_value,
            Some(Value::String(r#"{"imei":"000000000000000"}"#.to_string()))
        );
        let pkg = config.static_fields.iter().find(|f| f.name == "CLONE_PACKAGE").unwrap();
        assert_eq!(pkg.initial_value, Some(Value::String("com.app.clone1".to_string())));
    }

    #[test]
    fn stubs_cover_every_hooked_method() {
        let pool = stub_pool("{}", "p");
        let hooks = pool.class(HOOK_CLASS).unwrap();
        let names: Vec<&str> = hooks.direct_methods.iter().map(|m| m.name.as_str()).collect();
        for stub in [
            "spoofSettingSecure",
            "spoofImei",
            "spoofImsi",
            "spoofWifiMac",
            "spoofSsid",
            "spoofUserAgent",
        ] {
            assert!(names.contains(&stub), "missing {stub}");
        }
        // every stub is static with a method body
        for m in &hooks.direct_methods {
            assert!(m.access_flags.contains(AccessFlags::STATIC));
            assert!(m.body.is_some());
        }
        assert!(hooks.virtual_methods.is_empty());
    }

    #[test]
    fn receiver_splits_direct_and_virtual() {
        let pool = stub_pool("{}", "p");
        let receiver = pool.class(RECEIVER_CLASS).unwrap();
        assert_eq!(receiver.direct_methods.len(), 1);
        assert_eq!(receiver.direct_methods[0].name, "<init>");
        assert_eq!(receiver.virtual_methods.len(), 1);
        assert_eq!(receiver.virtual_methods[0].name, "onReceive");
        assert_eq!(receiver.superclass.as_deref(), Some(RECEIVER_SUPER));
    }

    #[test]
    fn stub_pool_serializes() {
        let pool = stub_pool(r#"{"ssid":"\"quoted\""}"#, "com.app.clone1");
        let bytes = pool.build().unwrap();
        let round = DexPool::parse(&bytes).unwrap();
        assert_eq!(round.classes.len(), 3);
        let hooks = round.class(HOOK_CLASS).unwrap();
        assert_eq!(hooks.direct_methods.len(), 6);
    }
}
