#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use crate::apk::zip::{ApkCompression, ApkEntry, ApkFile};
    use crate::cloner::ClonePipeline;
    use crate::config::CloneConfig;
    use crate::dex::pool::DexPool;
    use crate::error::CloneError;
    use crate::hook::{CONFIG_CLASS, HOOK_CLASS, RECEIVER_CLASS};
    use crate::sign::keystore::FileKeyStore;
    use crate::tests::fixtures;

    const GARBAGE: &[u8] = b"this is not bytecode at all, not even close";

    fn source_apk_bytes() -> Vec<u8> {
        let mut apk = ApkFile::new();
        apk.insert_entry(
            "AndroidManifest.xml",
            ApkEntry::fresh(fixtures::axml_document(&[
                "com.app",
                "com.app.provider",
                "label",
            ])),
        )
        .unwrap();
        apk.insert_entry("classes.dex", ApkEntry::fresh(fixtures::hooked_dex())).unwrap();
        apk.insert_entry(
            "classes2.dex",
            ApkEntry::fresh_with_compression(GARBAGE.to_vec(), ApkCompression::Stored),
        )
        .unwrap();
        apk.insert_entry(
            "assets/data.bin",
            ApkEntry::fresh_with_compression(vec![0xA5; 4096], ApkCompression::Stored),
        )
        .unwrap();
        apk.to_bytes().unwrap()
    }

    fn raw_zip_entry(bytes: &[u8], name: &str) -> (u16, u32, Vec<u8>) {
        let mut zip = zip::ZipArchive::new(Cursor::new(bytes.to_vec())).unwrap();
        let idx = zip.index_for_name(name).unwrap();
        let mut file = zip.by_index_raw(idx).unwrap();
        let method = match file.compression() {
            zip::CompressionMethod::Stored => 0,
            zip::CompressionMethod::Deflated => 8,
            other => panic!("unexpected method {other:?}"),
        };
        let crc = file.crc32();
        let mut raw = Vec::new();
        file.read_to_end(&mut raw).unwrap();
        (method, crc, raw)
    }

    #[test]
    fn clones_sign_and_preserve_untouched_entries() {
        let dir = fixtures::temp_workspace("end-to-end");
        let source_bytes = source_apk_bytes();
        let source = dir.join("source.apk");
        std::fs::write(&source, &source_bytes).unwrap();

        let keys = FileKeyStore::new(dir.join("keys.pem"));
        let out_dir = dir.join("out");
        let mut config = CloneConfig::new(&source, "com.app", "com.app.clone1", &out_dir);
        config.identity.insert("imei".to_string(), "490154203237518".to_string());

        let mut steps: Vec<(String, u8)> = Vec::new();
        let outcome = ClonePipeline::new(config, &keys)
            .run(&mut |step, pct| steps.push((step.to_string(), pct)))
            .unwrap();

        assert_eq!(outcome.clone_package, "com.app.clone1");
        assert_eq!(outcome.apk_path, out_dir.join("com.app.clone1.apk"));
        let signed = std::fs::read(&outcome.apk_path).unwrap();
        assert!(!signed.is_empty());

        // progress never goes backwards and finishes at 100
        assert!(steps.windows(2).all(|w| w[0].1 <= w[1].1));
        assert_eq!(steps.last().unwrap().1, 100);

        crate::sign::v2::verify(&signed).unwrap();

        let out = ApkFile::from_bytes(&signed).unwrap();
        for name in ["META-INF/MANIFEST.MF", "META-INF/CERT.SF", "META-INF/CERT.RSA"] {
            assert!(out.contains(name), "missing {name}");
        }

        // every package-derived pool string was renamed
        let manifest = out.entry("AndroidManifest.xml").unwrap().uncompressed().unwrap();
        let find = |needle: &[u8]| manifest.windows(needle.len()).any(|w| w == needle);
        assert!(find(&fixtures::utf16_bytes("com.app.clone1")));
        assert!(find(&fixtures::utf16_bytes("com.app.clone1.provider")));
        assert!(find(&fixtures::utf16_bytes("label")));

        // stub classes merged in and the call site redirected
        let primary = out.entry("classes.dex").unwrap().uncompressed().unwrap();
        let pool = DexPool::parse(&primary).unwrap();
        for descriptor in [HOOK_CLASS, CONFIG_CLASS, RECEIVER_CLASS] {
            assert!(pool.class(descriptor).is_some(), "missing {descriptor}");
        }
        let main = pool.class("Lcom/app/Main;").unwrap();
        let call = &main.direct_methods[0].body.as_ref().unwrap().instructions[0];
        assert_eq!(call.opcode(), 0x71);
        match &call.reference {
            crate::dex::pool::InsnRef::Method(m) => {
                assert_eq!(m.class, HOOK_CLASS);
                assert_eq!(m.name, "spoofImei");
                assert_eq!(m.proto.parameters, vec!["Landroid/telephony/TelephonyManager;"]);
            }
            other => panic!("unexpected reference {other:?}"),
        }

        // the unparseable secondary file fell back to its original bytes
        let secondary = out.entry("classes2.dex").unwrap().uncompressed().unwrap();
        assert_eq!(secondary, GARBAGE);

        // untouched entries keep method, crc and stored payload
        assert_eq!(
            raw_zip_entry(&source_bytes, "assets/data.bin"),
            raw_zip_entry(&signed, "assets/data.bin")
        );
    }

    #[test]
    fn unreadable_source_is_rejected_up_front() {
        let dir = fixtures::temp_workspace("missing-source");
        let keys = FileKeyStore::new(dir.join("keys.pem"));
        let config =
            CloneConfig::new(dir.join("nope.apk"), "com.app", "com.app.clone1", dir.join("out"));
        let err = ClonePipeline::new(config, &keys).run(&mut |_, _| {}).unwrap_err();
        assert!(matches!(err, CloneError::InvalidInput(_)), "got {err}");
    }

    #[test]
    fn identical_package_names_are_rejected() {
        let dir = fixtures::temp_workspace("same-package");
        let source = dir.join("source.apk");
        std::fs::write(&source, source_apk_bytes()).unwrap();
        let keys = FileKeyStore::new(dir.join("keys.pem"));
        let config = CloneConfig::new(&source, "com.app", "com.app", dir.join("out"));
        let err = ClonePipeline::new(config, &keys).run(&mut |_, _| {}).unwrap_err();
        assert!(matches!(err, CloneError::InvalidInput(_)), "got {err}");
    }

    #[test]
    fn a_container_without_a_manifest_is_rejected() {
        let dir = fixtures::temp_workspace("no-manifest");
        let mut apk = ApkFile::new();
        apk.insert_entry("assets/data.bin", ApkEntry::fresh(vec![1, 2, 3])).unwrap();
        let source = dir.join("source.apk");
        apk.write_to_file(&source).unwrap();

        let keys = FileKeyStore::new(dir.join("keys.pem"));
        let config = CloneConfig::new(&source, "com.app", "com.app.clone1", dir.join("out"));
        let err = ClonePipeline::new(config, &keys).run(&mut |_, _| {}).unwrap_err();
        assert!(matches!(err, CloneError::InvalidInput(_)), "got {err}");
    }

    #[test]
    fn a_broken_primary_bytecode_file_is_fatal() {
        let dir = fixtures::temp_workspace("broken-primary");
        let mut apk = ApkFile::new();
        apk.insert_entry(
            "AndroidManifest.xml",
            ApkEntry::fresh(fixtures::axml_document(&["com.app"])),
        )
        .unwrap();
        apk.insert_entry("classes.dex", ApkEntry::fresh(GARBAGE.to_vec())).unwrap();
        let source = dir.join("source.apk");
        apk.write_to_file(&source).unwrap();

        let keys = FileKeyStore::new(dir.join("keys.pem"));
        let config = CloneConfig::new(&source, "com.app", "com.app.clone1", dir.join("out"));
        let err = ClonePipeline::new(config, &keys).run(&mut |_, _| {}).unwrap_err();
        assert!(matches!(err, CloneError::PrimaryDex(_)), "got {err}");
    }

    #[test]
    fn disabling_interception_passes_bytecode_through() {
        let dir = fixtures::temp_workspace("no-interception");
        let mut apk = ApkFile::new();
        apk.insert_entry(
            "AndroidManifest.xml",
            ApkEntry::fresh(fixtures::axml_document(&["com.app"])),
        )
        .unwrap();
        apk.insert_entry("classes.dex", ApkEntry::fresh(GARBAGE.to_vec())).unwrap();
        let source = dir.join("source.apk");
        apk.write_to_file(&source).unwrap();

        let keys = FileKeyStore::new(dir.join("keys.pem"));
        let mut config = CloneConfig::new(&source, "com.app", "com.app.clone1", dir.join("out"));
        config.enable_interception = false;
        let outcome = ClonePipeline::new(config, &keys).run(&mut |_, _| {}).unwrap();

        let signed = std::fs::read(&outcome.apk_path).unwrap();
        let out = ApkFile::from_bytes(&signed).unwrap();
        assert_eq!(out.entry("classes.dex").unwrap().uncompressed().unwrap(), GARBAGE);
        crate::sign::v2::verify(&signed).unwrap();
    }
}
