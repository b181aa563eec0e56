use filesystem::{Error, Fs, Mode};
use littlefs2::const_ram_storage;
use littlefs2::driver::Storage as LfsStorage;
use littlefs2::io::Result as LfsResult;
use nvm_store::{
    eeconfig, via, EncoderDefaults, EncoderMapStore, KeymapDefaults, KeymapStore, MacroStore,
    NvmStore, LAYER_COUNT, MATRIX_COLS, MATRIX_ROWS,
};

const_ram_storage!(
    name = RamStorage,
    trait = LfsStorage,
    erase_value = 0xff,
    read_size = 16,
    write_size = 256,
    cache_size_ty = littlefs2::consts::U256,
    block_size = 512,
    block_count = 160,
    lookahead_size_ty = littlefs2::consts::U1,
    filename_max_plus_one_ty = littlefs2::consts::U256,
    path_max_plus_one_ty = littlefs2::consts::U256,
    result = LfsResult,
);

struct Defaults;

impl KeymapDefaults for Defaults {
    fn keycode(&self, layer: u8, row: u8, col: u8) -> u16 {
        0x0400 | u16::from(layer) << 8 | u16::from(row) << 4 | u16::from(col)
    }
}

impl EncoderDefaults for Defaults {
    fn keycode(&self, layer: u8, encoder: u8, clockwise: bool) -> u16 {
        0x0100 | u16::from(layer) << 4 | u16::from(encoder) << 1 | u16::from(clockwise)
    }
}

fn boot() -> (Fs<RamStorage>, NvmStore<Defaults, Defaults>) {
    let mut fs = Fs::new(RamStorage::new());
    fs.init().expect("init failed");
    let mut nvm = NvmStore::new(Defaults, Defaults);
    nvm.post_init(&mut fs).expect("post_init failed");
    (fs, nvm)
}

fn file_bytes(fs: &mut Fs<RamStorage>, path: &str) -> Vec<u8> {
    let fd = fs.open(path, Mode::READ).unwrap_or_else(|err| {
        panic!("open {path}: {err:?}");
    });
    let mut buf = vec![0u8; 2048];
    let count = fs.read(fd, &mut buf).unwrap();
    fs.close(fd).unwrap();
    buf.truncate(count);
    buf
}

#[test]
fn fresh_boot_uses_defaults() {
    let (mut fs, nvm) = boot();
    assert_eq!(nvm.keymap.read(0, 0, 0), KeymapDefaults::keycode(&Defaults, 0, 0, 0));
    assert_eq!(nvm.encoders.read(0, 0, true), 0x0101);
    assert!(!fs.exists("layers/key00"));

    let mut buf = [0xAAu8; 4];
    nvm.macros.read_buffer(0, &mut buf);
    assert_eq!(buf, [0; 4]);
}

#[test]
fn single_override_is_written_as_an_override_list() {
    let (mut fs, mut nvm) = boot();
    nvm.keymap.update(2, 3, 4, 0xABCD);
    nvm.keymap.save(&mut fs).unwrap();

    assert_eq!(
        file_bytes(&mut fs, "layers/key02"),
        [0x01, 0x03, 0x04, 0xCD, 0xAB]
    );
    assert!(!fs.exists("layers/key00"));
}

#[test]
fn mass_change_is_written_as_a_full_grid() {
    let (mut fs, mut nvm) = boot();
    for row in 0..MATRIX_ROWS as u8 {
        for col in 0..MATRIX_COLS as u8 {
            nvm.keymap.update(5, row, col, 0x1234);
        }
    }
    nvm.keymap.save(&mut fs).unwrap();

    let bytes = file_bytes(&mut fs, "layers/key05");
    assert_eq!(bytes.len(), 1 + MATRIX_ROWS * MATRIX_COLS * 2);
    assert_eq!(bytes[0], 0x00);
    for pair in bytes[1..].chunks(2) {
        assert_eq!(pair, [0x34, 0x12]);
    }
}

#[test]
fn keymap_roundtrips_through_disk() {
    let (mut fs, mut nvm) = boot();
    nvm.keymap.update(0, 0, 0, 0x7001);
    nvm.keymap.update(2, 3, 4, 0xABCD);
    nvm.keymap.update(7, 5, 14, 0x7003);
    nvm.keymap.save(&mut fs).unwrap();

    let mut fresh = KeymapStore::new(Defaults);
    fresh.load(&mut fs).unwrap();
    for layer in 0..LAYER_COUNT as u8 {
        for row in 0..MATRIX_ROWS as u8 {
            for col in 0..MATRIX_COLS as u8 {
                assert_eq!(fresh.read(layer, row, col), nvm.keymap.read(layer, row, col));
            }
        }
    }

    // Loading is idempotent.
    fresh.load(&mut fs).unwrap();
    assert_eq!(fresh.read(2, 3, 4), 0xABCD);
    assert_eq!(fresh.read(0, 0, 0), 0x7001);
}

#[test]
fn reverting_every_key_deletes_the_layer_file() {
    let (mut fs, mut nvm) = boot();
    nvm.keymap.update(1, 1, 1, 0x9999);
    nvm.keymap.save(&mut fs).unwrap();
    assert!(fs.exists("layers/key01"));

    nvm.keymap.update(1, 1, 1, KeymapDefaults::keycode(&Defaults, 1, 1, 1));
    nvm.keymap.save(&mut fs).unwrap();
    assert!(!fs.exists("layers/key01"));
}

#[test]
fn corrupt_layer_file_falls_back_to_defaults() {
    let (mut fs, mut nvm) = boot();
    fs.update_block("layers/key01", &[0x07, 1, 2, 3]).unwrap();

    assert_eq!(nvm.keymap.load(&mut fs), Err(Error::Corrupt));
    assert_eq!(nvm.keymap.read(1, 2, 3), KeymapDefaults::keycode(&Defaults, 1, 2, 3));
}

#[test]
fn keymap_erase_restores_defaults() {
    let (mut fs, mut nvm) = boot();
    nvm.keymap.update(2, 3, 4, 0xABCD);
    nvm.keymap.save(&mut fs).unwrap();

    nvm.keymap.erase(&mut fs).unwrap();
    assert!(!fs.exists("layers/key02"));
    assert_eq!(nvm.keymap.read(2, 3, 4), KeymapDefaults::keycode(&Defaults, 2, 3, 4));
    // The layers directory is ready for the next save.
    nvm.keymap.update(0, 0, 0, 0x1111);
    nvm.keymap.save(&mut fs).unwrap();
    assert!(fs.exists("layers/key00"));
}

#[test]
fn encoder_single_override_bytes() {
    let (mut fs, mut nvm) = boot();
    nvm.encoders.update(1, 0, false, 0x2222);
    nvm.encoders.save(&mut fs).unwrap();

    assert_eq!(
        file_bytes(&mut fs, "layers/enc01"),
        [0x01, 0x00, 0x01, 0x22, 0x22]
    );
}

#[test]
fn encoder_tie_prefers_the_full_grid() {
    let (mut fs, mut nvm) = boot();
    // Two overrides cost as much as the whole grid, so the grid wins.
    nvm.encoders.update(1, 0, true, 0x4141);
    nvm.encoders.update(1, 1, false, 0x4242);
    nvm.encoders.save(&mut fs).unwrap();

    let bytes = file_bytes(&mut fs, "layers/enc01");
    assert_eq!(bytes.len(), 9);
    assert_eq!(bytes[0], 0x00);
    assert_eq!(&bytes[1..3], &[0x41, 0x41]);
}

#[test]
fn encoder_roundtrips_through_disk() {
    let (mut fs, mut nvm) = boot();
    nvm.encoders.update(1, 0, false, 0x2222);
    nvm.encoders.update(3, 1, true, 0x3333);
    nvm.encoders.save(&mut fs).unwrap();

    let mut fresh = EncoderMapStore::new(Defaults);
    fresh.load(&mut fs).unwrap();
    assert_eq!(fresh.read(1, 0, false), 0x2222);
    assert_eq!(fresh.read(3, 1, true), 0x3333);
    assert_eq!(fresh.read(1, 0, true), EncoderDefaults::keycode(&Defaults, 1, 0, true));
}

#[test]
fn macro_save_splits_at_nul_terminators() {
    let (mut fs, mut nvm) = boot();
    nvm.macros.update_buffer(0, b"hi\0bye\0");
    nvm.macros.save(&mut fs).unwrap();

    assert_eq!(file_bytes(&mut fs, "macros/00"), b"hi");
    assert_eq!(file_bytes(&mut fs, "macros/01"), b"bye");
    assert!(!fs.exists("macros/02"));

    let mut fresh = MacroStore::new();
    fresh.load(&mut fs).unwrap();
    let mut buf = [0u8; 8];
    fresh.read_buffer(0, &mut buf);
    assert_eq!(&buf, b"hi\0bye\0\0");
}

#[test]
fn macro_save_is_change_driven() {
    let (mut fs, mut nvm) = boot();
    nvm.macros.save(&mut fs).unwrap();
    assert!(!fs.exists("macros/00"));

    nvm.macros.update_buffer(0, b"hi\0");
    nvm.macros.save(&mut fs).unwrap();
    assert!(fs.exists("macros/00"));
}

#[test]
fn macro_reset_clears_disk_and_ram() {
    let (mut fs, mut nvm) = boot();
    nvm.macros.update_buffer(0, b"hi\0");
    nvm.macros.save(&mut fs).unwrap();

    nvm.macros.reset(&mut fs).unwrap();
    assert!(!fs.exists("macros/00"));
    let mut buf = [0u8; 4];
    nvm.macros.read_buffer(0, &mut buf);
    assert_eq!(buf, [0; 4]);
}

#[test]
fn eeconfig_magic_cycle() {
    let (mut fs, _nvm) = boot();
    assert!(!eeconfig::is_enabled(&mut fs));
    assert!(!eeconfig::is_disabled(&mut fs));

    eeconfig::enable(&mut fs).unwrap();
    assert!(eeconfig::is_enabled(&mut fs));

    eeconfig::update_debug(&mut fs, 0x05).unwrap();
    eeconfig::disable(&mut fs).unwrap();
    assert!(eeconfig::is_disabled(&mut fs));
    // The erase dropped every other entry.
    assert_eq!(eeconfig::read_debug(&mut fs), 0);

    eeconfig::enable(&mut fs).unwrap();
    assert!(eeconfig::is_enabled(&mut fs));
}

#[test]
fn eeconfig_values_roundtrip() {
    let (mut fs, _nvm) = boot();
    eeconfig::update_debug(&mut fs, 0x03).unwrap();
    eeconfig::update_default_layer(&mut fs, 1 << 4).unwrap();
    eeconfig::update_keymap(&mut fs, 0x0210).unwrap();
    eeconfig::update_audio(&mut fs, 7).unwrap();
    eeconfig::update_backlight(&mut fs, 0x81).unwrap();
    eeconfig::update_rgblight(&mut fs, 0x0102_0304_0506_0708).unwrap();
    eeconfig::update_handedness(&mut fs, true).unwrap();
    eeconfig::update_keymap_hash(&mut fs, 0xDEAD_BEEF).unwrap();

    assert_eq!(eeconfig::read_debug(&mut fs), 0x03);
    assert_eq!(eeconfig::read_default_layer(&mut fs), 1 << 4);
    assert_eq!(eeconfig::read_keymap(&mut fs), 0x0210);
    assert_eq!(eeconfig::read_audio(&mut fs), 7);
    assert_eq!(eeconfig::read_backlight(&mut fs), 0x81);
    assert_eq!(eeconfig::read_rgblight(&mut fs), 0x0102_0304_0506_0708);
    assert!(eeconfig::read_handedness(&mut fs));
    assert_eq!(eeconfig::read_keymap_hash(&mut fs), 0xDEAD_BEEF);
}

#[test]
fn datablock_reads_zeros_until_initialized() {
    let (mut fs, _nvm) = boot();
    let mut buf = [0xAAu8; 8];
    eeconfig::read_kb_datablock(&mut fs, 0, &mut buf);
    assert_eq!(buf, [0; 8]);
    assert!(!eeconfig::is_kb_datablock_valid(&mut fs));

    eeconfig::init_kb_datablock(&mut fs).unwrap();
    assert!(eeconfig::is_kb_datablock_valid(&mut fs));

    // The block file spans the configured size, zero-filled.
    let block = file_bytes(&mut fs, "ee/kb_datablock");
    assert_eq!(block.len(), eeconfig::KB_DATA_SIZE);
    assert!(block.iter().all(|&b| b == 0));

    eeconfig::update_kb_datablock(&mut fs, 8, &[1, 2, 3, 4]).unwrap();
    let mut buf = [0u8; 4];
    eeconfig::read_kb_datablock(&mut fs, 8, &mut buf);
    assert_eq!(buf, [1, 2, 3, 4]);
}

#[test]
fn datablock_version_mismatch_reads_zeros() {
    let (mut fs, _nvm) = boot();
    eeconfig::init_user_datablock(&mut fs).unwrap();
    eeconfig::update_user_datablock(&mut fs, 0, &[9, 9, 9]).unwrap();

    // A firmware with a different datablock version rejects the contents.
    eeconfig::update_user(&mut fs, 0x0BAD).unwrap();
    assert!(!eeconfig::is_user_datablock_valid(&mut fs));
    let mut buf = [0xAAu8; 3];
    eeconfig::read_user_datablock(&mut fs, 0, &mut buf);
    assert_eq!(buf, [0; 3]);
}

#[test]
fn via_state_roundtrips() {
    let (mut fs, _nvm) = boot();
    via::update_magic(&mut fs, [b'v', 0x02, 0x01]).unwrap();
    assert_eq!(via::read_magic(&mut fs), [b'v', 0x02, 0x01]);

    via::update_layout_options(&mut fs, 0x0001_0002).unwrap();
    assert_eq!(via::read_layout_options(&mut fs), 0x0001_0002);

    via::update_custom_config(&mut fs, 4, &[0xDE, 0xAD]).unwrap();
    let mut buf = [0u8; 4];
    via::read_custom_config(&mut fs, 2, &mut buf);
    assert_eq!(buf, [0, 0, 0xDE, 0xAD]);

    via::erase(&mut fs).unwrap();
    assert_eq!(via::read_magic(&mut fs), [0; 3]);
}

#[test]
fn housekeeping_throttles_saves() {
    let (mut fs, mut nvm) = boot();
    nvm.keymap.update(0, 0, 0, 0x7777);

    // Not yet: the interval since boot has not elapsed.
    nvm.housekeeping(&mut fs, 100).unwrap();
    assert!(!fs.exists("layers/key00"));

    nvm.housekeeping(&mut fs, 250).unwrap();
    assert!(fs.exists("layers/key00"));

    // A fresh change within the throttle window stays in RAM.
    nvm.keymap.update(0, 0, 1, 0x8888);
    nvm.housekeeping(&mut fs, 400).unwrap();
    let mut fresh = KeymapStore::new(Defaults);
    fresh.load(&mut fs).unwrap();
    assert_eq!(fresh.read(0, 0, 1), KeymapDefaults::keycode(&Defaults, 0, 0, 1));

    nvm.housekeeping(&mut fs, 520).unwrap();
    fresh.load(&mut fs).unwrap();
    assert_eq!(fresh.read(0, 0, 1), 0x8888);
}

#[test]
fn everything_survives_a_reboot() {
    let (mut fs, mut nvm) = boot();
    nvm.keymap.update(2, 3, 4, 0xABCD);
    nvm.encoders.update(1, 0, false, 0x2222);
    nvm.macros.update_buffer(0, b"hi\0bye\0");
    nvm.housekeeping(&mut fs, 250).unwrap();
    eeconfig::enable(&mut fs).unwrap();

    // Reboot: remount the same storage, fresh RAM state.
    let mut fs = Fs::new(fs.into_storage());
    fs.init().unwrap();
    let mut nvm = NvmStore::new(Defaults, Defaults);
    nvm.post_init(&mut fs).unwrap();

    assert_eq!(nvm.keymap.read(2, 3, 4), 0xABCD);
    assert_eq!(nvm.keymap.read(0, 0, 0), KeymapDefaults::keycode(&Defaults, 0, 0, 0));
    assert_eq!(nvm.encoders.read(1, 0, false), 0x2222);
    let mut buf = [0u8; 7];
    nvm.macros.read_buffer(0, &mut buf);
    assert_eq!(&buf, b"hi\0bye\0");
    assert!(eeconfig::is_enabled(&mut fs));
}
