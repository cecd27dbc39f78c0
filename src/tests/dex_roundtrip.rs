#[cfg(test)]
mod tests
{
    use adler::adler32_slice;
    use sha1::{Digest, Sha1};

    use crate::dex::pool::{
        AccessFlags, Annotation, AnnotationBody, AnnotationVisibility, CatchPair, ClassDef,
        DebugInfo, DebugOp, DexPool, FieldDef, InsnRef, Instruction, MethodBody, MethodDef,
        MethodProto, TryBlock, Value,
    };

    fn empty_body() -> MethodBody
    {
        MethodBody {
            registers: 1,
            ins: 1,
            outs: 0,
            instructions: vec![Instruction::from_units(vec![0x000e])],
            tries: vec![],
            debug_info: None,
        }
    }

    fn sample_pool() -> DexPool
    {
        let mut iface = ClassDef::new(
            "Lcom/app/Iface;",
            AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT,
            "Ljava/lang/Object;",
        );
        iface.virtual_methods.push(MethodDef {
            name: "describe".to_string(),
            proto: MethodProto::new("Ljava/lang/String;", &[]),
            access_flags: AccessFlags::PUBLIC | AccessFlags::ABSTRACT,
            body: None,
            annotations: vec![],
            parameter_annotations: vec![],
        });

        let mut class = ClassDef::new(
            "Lcom/app/Widget;",
            AccessFlags::PUBLIC,
            "Ljava/lang/Object;",
        );
        class.interfaces.push("Lcom/app/Iface;".to_string());
        class.source_file = Some("Widget.java".to_string());

        class.static_fields.push(FieldDef {
            name: "LIMIT".to_string(),
            descriptor: "I".to_string(),
            access_flags: AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::FINAL,
            initial_value: Some(Value::Int(42)),
            annotations: vec![],
        });
        class.static_fields.push(FieldDef {
            name: "RATIO".to_string(),
            descriptor: "F".to_string(),
            access_flags: AccessFlags::STATIC | AccessFlags::FINAL,
            initial_value: Some(Value::Float(2.5)),
            annotations: vec![],
        });
        class.static_fields.push(FieldDef {
            name: "TAG".to_string(),
            descriptor: "Ljava/lang/String;".to_string(),
            access_flags: AccessFlags::STATIC | AccessFlags::FINAL,
            initial_value: Some(Value::String("widget".to_string())),
            annotations: vec![],
        });
        class.instance_fields.push(FieldDef {
            name: "label".to_string(),
            descriptor: "Ljava/lang/String;".to_string(),
            access_flags: AccessFlags::PRIVATE,
            initial_value: None,
            annotations: vec![Annotation {
                visibility: AnnotationVisibility::Runtime,
                body: AnnotationBody {
                    type_descriptor: "Lcom/app/Marker;".to_string(),
                    elements: vec![("value".to_string(), Value::String("ui".to_string()))],
                },
            }],
        });

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
                        units: vec![0x1070, 0, 0x0000],
                        reference: InsnRef::Method(crate::dex::pool::MethodRef::new(
                            "Ljava/lang/Object;",
                            "<init>",
                            MethodProto::new("V", &[]),
                        )),
                    },
                    Instruction::from_units(vec![0x000e]),
                ],
                tries: vec![],
                debug_info: Some(DebugInfo {
                    line_start: 10,
                    parameter_names: vec![],
                    bytecode: vec![DebugOp::AdvanceLine(2), DebugOp::Special(0x0b)],
                }),
            }),
            annotations: vec![],
            parameter_annotations: vec![],
        });

        class.virtual_methods.push(MethodDef {
            name: "describe".to_string(),
            proto: MethodProto::new("Ljava/lang/String;", &[]),
            access_flags: AccessFlags::PUBLIC,
            body: Some(MethodBody {
                registers: 1,
                ins: 1,
                outs: 0,
                instructions: vec![
                    // try region: const-string v0 then return, handler at 3
                    Instruction {
                        units: vec![0x001a, 0],
                        reference: InsnRef::String("widget".to_string()),
                    },
                    Instruction::from_units(vec![0x0011]),
                    Instruction::from_units(vec![0x000d]), // move-exception v0
                    Instruction::from_units(vec![0x0011]),
                ],
                tries: vec![TryBlock {
                    start_addr: 0,
                    insn_count: 3,
                    catches: vec![CatchPair {
                        exception: "Ljava/lang/RuntimeException;".to_string(),
                        addr: 3,
                    }],
                    catch_all_addr: Some(3),
                }],
                debug_info: None,
            }),
            annotations: vec![],
            parameter_annotations: vec![],
        });
        class.virtual_methods.push(MethodDef {
            name: "reset".to_string(),
            proto: MethodProto::new("V", &[]),
            access_flags: AccessFlags::PUBLIC,
            body: Some(empty_body()),
            annotations: vec![],
            parameter_annotations: vec![],
        });

        DexPool { classes: vec![iface, class] }
    }

    #[test]
    fn pool_survives_a_build_and_reparse()
    {
        let pool = sample_pool();
        let bytes = pool.build().unwrap();
        let back = DexPool::parse(&bytes).unwrap();

        assert_eq!(back.classes.len(), 2);
        let iface = back.class("Lcom/app/Iface;").unwrap();
        assert!(iface.access_flags.contains(AccessFlags::INTERFACE));
        assert_eq!(iface.virtual_methods.len(), 1);
        assert!(iface.virtual_methods[0].body.is_none());

        let class = back.class("Lcom/app/Widget;").unwrap();
        assert_eq!(class.superclass.as_deref(), Some("Ljava/lang/Object;"));
        assert_eq!(class.interfaces, vec!["Lcom/app/Iface;".to_string()]);
        assert_eq!(class.source_file.as_deref(), Some("Widget.java"));

        // the direct/virtual split must survive exactly
        assert_eq!(class.direct_methods.len(), 1);
        assert_eq!(class.direct_methods[0].name, "<init>");
        assert_eq!(class.virtual_methods.len(), 2);

        let limit = class.static_fields.iter().find(|f| f.name == "LIMIT").unwrap();
        assert_eq!(limit.initial_value, Some(Value::Int(42)));
        let ratio = class.static_fields.iter().find(|f| f.name == "RATIO").unwrap();
        assert_eq!(ratio.initial_value, Some(Value::Float(2.5)));
        let tag = class.static_fields.iter().find(|f| f.name == "TAG").unwrap();
        assert_eq!(tag.initial_value, Some(Value::String("widget".to_string())));

        let label = &class.instance_fields[0];
        assert_eq!(label.annotations.len(), 1);
        assert_eq!(label.annotations[0].visibility, AnnotationVisibility::Runtime);
        assert_eq!(label.annotations[0].body.type_descriptor, "Lcom/app/Marker;");
        assert_eq!(
            label.annotations[0].body.elements,
            vec![("value".to_string(), Value::String("ui".to_string()))]
        );

        let describe = class
            .virtual_methods
            .iter()
            .find(|m| m.name == "describe")
            .unwrap();
        let body = describe.body.as_ref().unwrap();
        assert_eq!(body.tries.len(), 1);
        assert_eq!(body.tries[0].start_addr, 0);
        assert_eq!(body.tries[0].insn_count, 3);
        assert_eq!(body.tries[0].catch_all_addr, Some(3));
        assert_eq!(body.tries[0].catches[0].exception, "Ljava/lang/RuntimeException;");
        assert_eq!(body.tries[0].catches[0].addr, 3);
        assert_eq!(
            body.instructions[0].reference,
            InsnRef::String("widget".to_string())
        );

        let init = &class.direct_methods[0];
        let debug = init.body.as_ref().unwrap().debug_info.as_ref().unwrap();
        assert_eq!(debug.line_start, 10);
        assert_eq!(debug.bytecode, vec![DebugOp::AdvanceLine(2), DebugOp::Special(0x0b)]);
    }

    #[test]
    fn header_checksums_are_written()
    {
        let bytes = sample_pool().build().unwrap();

        let stored_adler = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(stored_adler, adler32_slice(&bytes[12..]));

        let mut hasher = Sha1::new();
        hasher.update(&bytes[32..]);
        let digest = hasher.finalize();
        assert_eq!(&bytes[12..32], digest.as_slice());
    }

    #[test]
    fn duplicate_classes_are_rejected()
    {
        let mut pool = sample_pool();
        let dup = pool.classes[1].clone();
        pool.classes.push(dup);
        let err = pool.build().unwrap_err();
        assert!(err.to_string().contains("Duplicate class"));
    }

    #[test]
    fn cyclic_hierarchies_are_rejected()
    {
        let a = ClassDef::new("Lcom/app/A;", AccessFlags::PUBLIC, "Lcom/app/B;");
        let b = ClassDef::new("Lcom/app/B;", AccessFlags::PUBLIC, "Lcom/app/A;");
        let pool = DexPool { classes: vec![a, b] };
        let err = pool.build().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn switch_payloads_and_jumbo_strings_roundtrip()
    {
        let mut class = ClassDef::new("Lcom/app/Jump;", AccessFlags::PUBLIC, "Ljava/lang/Object;");
        let instructions = vec![
            // packed-switch v1, payload at +4
            Instruction::from_units(vec![0x012b, 0x0004, 0x0000]),
            Instruction::from_units(vec![0x000e]),
            // packed-switch-payload: 2 entries, first_key = 7
            Instruction::from_units(vec![0x0100, 0x0002, 0x0007, 0x0000, 0x0003, 0x0000, 0x0003, 0x0000]),
            Instruction {
                units: vec![0x001b, 0, 0],
                reference: InsnRef::String("long pool entry".to_string()),
            },
            Instruction::from_units(vec![0x0011]),
        ];
        class.direct_methods.push(MethodDef {
            name: "pick".to_string(),
            proto: MethodProto::new("Ljava/lang/String;", &["I"]),
            access_flags: AccessFlags::PUBLIC | AccessFlags::STATIC,
            body: Some(MethodBody {
                registers: 2,
                ins: 1,
                outs: 0,
                instructions: instructions.clone(),
                tries: vec![],
                debug_info: None,
            }),
            annotations: vec![],
            parameter_annotations: vec![],
        });

        let pool = DexPool { classes: vec![class] };
        let back = DexPool::parse(&pool.build().unwrap()).unwrap();
        let body = back.classes[0].direct_methods[0].body.as_ref().unwrap();
        assert_eq!(body.instructions.len(), instructions.len());
        for (got, want) in body.instructions.iter().zip(&instructions)
        {
            assert_eq!(got.units.len(), want.units.len());
            assert_eq!(got.reference, want.reference);
        }
        assert_eq!(
            body.instructions[2].units,
            vec![0x0100, 0x0002, 0x0007, 0x0000, 0x0003, 0x0000, 0x0003, 0x0000]
        );
    }
}
