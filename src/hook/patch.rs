/* Call-site redirection.
 *
 * Every invoke whose target matches a hooked framework method is retargeted at
 * the corresponding static stub on the hook class. Virtual and interface calls
 * become invoke-static with the receiver passed as the first argument, which
 * keeps the register list and instruction width intact, so no other offset in
 * the method moves.
 */

use log::{debug, warn};
use once_cell::sync::Lazy;

use crate::dex::pool::{DexPool, InsnRef, MethodDef, MethodProto, MethodRef};
use crate::dex::insns::{
    OP_INVOKE_INTERFACE, OP_INVOKE_INTERFACE_RANGE, OP_INVOKE_STATIC, OP_INVOKE_STATIC_RANGE,
    OP_INVOKE_VIRTUAL, OP_INVOKE_VIRTUAL_RANGE,
};
use crate::hook::HOOK_CLASS;

struct Hook {
    target: MethodRef,
    stub: MethodRef,
}

fn instance_hook(class: &str, name: &str, stub_name: &str, return_type: &str, params: &[&str]) -> Hook {
    let mut stub_params = vec![class];
    stub_params.extend_from_slice(params);
    Hook {
        target: MethodRef::new(class, name, MethodProto::new(return_type, params)),
        stub: MethodRef::new(HOOK_CLASS, stub_name, MethodProto::new(return_type, &stub_params)),
    }
}

fn static_hook(class: &str, name: &str, stub_name: &str, return_type: &str, params: &[&str]) -> Hook {
    Hook {
        target: MethodRef::new(class, name, MethodProto::new(return_type, params)),
        stub: MethodRef::new(HOOK_CLASS, stub_name, MethodProto::new(return_type, params)),
    }
}

const STRING: &str = "Ljava/lang/String;";

static HOOKS: Lazy<Vec<Hook>> = Lazy::new(|| {
    vec![
        static_hook(
            "Landroid/provider/Settings$Secure;",
            "getString",
            "spoofSettingSecure",
            STRING,
            &["Landroid/content/ContentResolver;", STRING],
        ),
        instance_hook("Landroid/telephony/TelephonyManager;", "getDeviceId", "spoofImei", STRING, &[]),
        instance_hook("Landroid/telephony/TelephonyManager;", "getImei", "spoofImei", STRING, &[]),
        instance_hook("Landroid/telephony/TelephonyManager;", "getSubscriberId", "spoofImsi", STRING, &[]),
        instance_hook("Landroid/net/wifi/WifiInfo;", "getMacAddress", "spoofWifiMac", STRING, &[]),
        instance_hook("Landroid/net/wifi/WifiInfo;", "getSSID", "spoofSsid", STRING, &[]),
        instance_hook("Landroid/webkit/WebSettings;", "getUserAgentString", "spoofUserAgent", STRING, &[]),
    ]
});

fn hook_for(target: &MethodRef) -> Option<&'static Hook> {
    HOOKS.iter().find(|h| h.target == *target)
}

/// Rewrites every hooked call site in one method. Returns the number of
/// instructions changed.
pub fn patch_method(method: &mut MethodDef) -> usize {
    let Some(body) = method.body.as_mut() else {
        return 0;
    };

    let mut rewritten = 0;
    for insn in body.instructions.iter_mut() {
        let InsnRef::Method(target) = &insn.reference else {
            continue;
        };
        let Some(hook) = hook_for(target) else {
            continue;
        };

        let op = insn.opcode();
        let swapped = match op {
            OP_INVOKE_VIRTUAL | OP_INVOKE_INTERFACE => Some(OP_INVOKE_STATIC),
            OP_INVOKE_VIRTUAL_RANGE | OP_INVOKE_INTERFACE_RANGE => Some(OP_INVOKE_STATIC_RANGE),
            OP_INVOKE_STATIC | OP_INVOKE_STATIC_RANGE => Some(op),
            _ => None,
        };
        let Some(new_op) = swapped else {
            continue;
        };

        insn.units[0] = (insn.units[0] & 0xff00) | new_op as u16;
        insn.reference = InsnRef::Method(hook.stub.clone());
        rewritten += 1;
    }
    rewritten
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub methods_patched: usize,
    pub calls_rewritten: usize,
}

/// Patches every class in the pool, skipping the hook classes themselves.
pub fn patch_pool(pool: &mut DexPool) -> PatchStats {
    let mut stats = PatchStats::default();
    for class in pool.classes.iter_mut() {
        if class.descriptor.starts_with("Lcom/clone/hook/") {
            continue;
        }
        let descriptor = class.descriptor.clone();
        for method in class.methods_mut() {
            let calls = patch_method(method);
            if calls > 0 {
                debug!(
                    "redirected {} call(s) in {}->{}",
                    calls, descriptor, method.name
                );
                stats.methods_patched += 1;
                stats.calls_rewritten += calls;
            }
        }
    }
    stats
}

/// Result of patching one bytecode file.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    Patched(Vec<u8>),
    /// The input bytes, because nothing matched or the file could not be
    /// processed. Never fatal on its own.
    Original(Vec<u8>),
}

/// Patches a whole serialized bytecode file, falling back to the original
/// bytes when it cannot be parsed or rebuilt.
pub fn patch_dex(name: &str, bytes: Vec<u8>) -> PatchOutcome {
    let mut pool = match DexPool::parse(&bytes) {
        Ok(pool) => pool,
        Err(err) => {
            warn!("leaving {} unpatched: {}", name, err);
            return PatchOutcome::Original(bytes);
        }
    };
    let stats = patch_pool(&mut pool);
    if stats.calls_rewritten == 0 {
        return PatchOutcome::Original(bytes);
    }
    match pool.build() {
        Ok(patched) => PatchOutcome::Patched(patched),
        Err(err) => {
            warn!("leaving {} unpatched: {}", name, err);
            PatchOutcome::Original(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::pool::{AccessFlags, ClassDef, Instruction, MethodBody};

    fn imei_call(op: u8, unit0_high: u16) -> Instruction {
        Instruction {
            units: vec![(unit0_high << 8) | op as u16, 0, 0x0001],
            reference: InsnRef::Method(MethodRef::new(
                "Landroid/telephony/TelephonyManager;",
                "getDeviceId",
                MethodProto::new(STRING, &[]),
            )),
        }
    }

    fn method_with(instructions: Vec<Instruction>) -> MethodDef {
        MethodDef {
            name: "run".to_string(),
            proto: MethodProto::new("V", &[]),
            access_flags: AccessFlags::PUBLIC,
            body: Some(MethodBody {
                registers: 4,
                ins: 1,
                outs: 1,
                instructions,
                tries: vec![],
                debug_info: None,
            }),
            annotations: vec![],
            parameter_annotations: vec![],
        }
    }

    #[test]
    fn virtual_call_becomes_static_stub() {
        let mut method = method_with(vec![imei_call(OP_INVOKE_VIRTUAL, 0x10)]);
        assert_eq!(patch_method(&mut method), 1);

        let insn = &method.body.as_ref().unwrap().instructions[0];
        assert_eq!(insn.opcode(), OP_INVOKE_STATIC);
        // register list and width are untouched
        assert_eq!(insn.units[0] >> 8, 0x10);
        assert_eq!(insn.width(), 3);
        let InsnRef::Method(m) = &insn.reference else {
            panic!("reference lost");
        };
        assert_eq!(m.class, HOOK_CLASS);
        assert_eq!(m.name, "spoofImei");
        assert_eq!(m.proto.parameters, vec!["Landroid/telephony/TelephonyManager;"]);
    }

    #[test]
    fn range_call_keeps_range_form() {
        let mut method = method_with(vec![imei_call(OP_INVOKE_VIRTUAL_RANGE, 0x01)]);
        assert_eq!(patch_method(&mut method), 1);
        assert_eq!(
            method.body.as_ref().unwrap().instructions[0].opcode(),
            OP_INVOKE_STATIC_RANGE
        );
    }

    #[test]
    fn static_hook_keeps_signature() {
        let call = Instruction {
            units: vec![0x2071, 0, 0x0021],
            reference: InsnRef::Method(MethodRef::new(
                "Landroid/provider/Settings$Secure;",
                "getString",
                MethodProto::new(STRING, &["Landroid/content/ContentResolver;", STRING]),
            )),
        };
        let mut method = method_with(vec![call]);
        assert_eq!(patch_method(&mut method), 1);

        let insn = &method.body.as_ref().unwrap().instructions[0];
        assert_eq!(insn.opcode(), OP_INVOKE_STATIC);
        let InsnRef::Method(m) = &insn.reference else {
            panic!("reference lost");
        };
        assert_eq!(m.name, "spoofSettingSecure");
        assert_eq!(m.proto.parameters.len(), 2);
    }

    #[test]
    fn unrelated_and_super_calls_untouched() {
        let other = Instruction {
            units: vec![0x106e, 0, 0x0000],
            reference: InsnRef::Method(MethodRef::new(
                "Ljava/lang/Object;",
                "toString",
                MethodProto::new(STRING, &[]),
            )),
        };
        // invoke-super on a hooked signature stays alone
        let sup = imei_call(0x6f, 0x10);
        let mut method = method_with(vec![other.clone(), sup.clone()]);
        assert_eq!(patch_method(&mut method), 0);
        let body = method.body.as_ref().unwrap();
        assert_eq!(body.instructions[0], other);
        assert_eq!(body.instructions[1], sup);
    }

    #[test]
    fn malformed_file_falls_back_to_original() {
        let garbage = vec![0u8; 64];
        assert_eq!(
            patch_dex("classes2.dex", garbage.clone()),
            PatchOutcome::Original(garbage)
        );
    }

    #[test]
    fn patched_file_roundtrips_with_redirected_call() {
        let mut class = ClassDef::new("Lcom/app/Main;", AccessFlags::PUBLIC, "Ljava/lang/Object;");
        let mut method = method_with(vec![
            imei_call(OP_INVOKE_VIRTUAL, 0x10),
            Instruction::from_units(vec![0x0011]),
        ]);
        method.access_flags |= AccessFlags::STATIC;
        class.direct_methods.push(method);
        let pool = DexPool { classes: vec![class] };
        let bytes = pool.build().unwrap();

        let PatchOutcome::Patched(patched) = patch_dex("classes.dex", bytes) else {
            panic!("expected a patched file");
        };
        let reread = DexPool::parse(&patched).unwrap();
        let method = &reread.class("Lcom/app/Main;").unwrap().direct_methods[0];
        let insn = &method.body.as_ref().unwrap().instructions[0];
        assert_eq!(insn.opcode(), OP_INVOKE_STATIC);
        let InsnRef::Method(m) = &insn.reference else {
            panic!("reference lost");
        };
        assert_eq!(m.class, HOOK_CLASS);
    }

    #[test]
    fn pool_patch_skips_hook_classes() {
        let mut class = ClassDef::new("Lcom/app/Main;", AccessFlags::PUBLIC, "Ljava/lang/Object;");
        class.virtual_methods.push(method_with(vec![imei_call(OP_INVOKE_VIRTUAL, 0x10)]));
        let mut own = ClassDef::new(HOOK_CLASS, AccessFlags::PUBLIC, "Ljava/lang/Object;");
        own.direct_methods.push(method_with(vec![imei_call(OP_INVOKE_VIRTUAL, 0x10)]));

        let mut pool = DexPool { classes: vec![class, own] };
        let stats = patch_pool(&mut pool);
        assert_eq!(stats, PatchStats { methods_patched: 1, calls_rewritten: 1 });

        let untouched = &pool.classes[1].direct_methods[0];
        assert_eq!(
            untouched.body.as_ref().unwrap().instructions[0].opcode(),
            OP_INVOKE_VIRTUAL
        );
    }
}
