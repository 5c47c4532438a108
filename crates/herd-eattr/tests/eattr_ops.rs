#![forbid(unsafe_code)]
//! End-to-end attribute operations over an in-memory volume.

use herd_block::{BlockDevice, MemBlockDevice};
use herd_cluster::{
    MemJournal, MemSpaceAccounting, NodeLockManager, NoopQuota, WithdrawState,
};
use herd_eattr::{EaType, SetFlags};
use herd_error::HerdError;
use herd_rgrp::{
    Inode, InodeFlags, RindexEntry, Services, VecRindexSource, Volume, format_resource_group,
};
use herd_types::{
    BLKST_FREE, BlockNumber, BlockSize, InodeNumber, JournalSlot, META_HEADER_SIZE,
    VolumeGeometry, write_le_u32,
};
use std::sync::Arc;

const BLOCK_SIZE: u32 = 512;

struct Harness {
    dev: Arc<MemBlockDevice>,
    space: Arc<MemSpaceAccounting>,
    withdraw: Arc<WithdrawState>,
    vol: Arc<Volume>,
}

fn harness() -> Harness {
    // One group owning data blocks [100, 1124).
    let ri = RindexEntry {
        addr: BlockNumber(10),
        length: 1,
        data0: BlockNumber(100),
        data: 1024,
        bitbytes: 256,
    };
    let dev = Arc::new(MemBlockDevice::new(BLOCK_SIZE, 1 << 16));
    format_resource_group(&*dev, &ri).unwrap();

    let space = Arc::new(MemSpaceAccounting::new());
    let withdraw = Arc::new(WithdrawState::default());
    let services = Services {
        dev: dev.clone(),
        locks: Arc::new(NodeLockManager::new()),
        journal: Arc::new(MemJournal::new()),
        quota: Arc::new(NoopQuota),
        space: space.clone(),
        withdraw: withdraw.clone(),
    };
    let geo = VolumeGeometry {
        block_size: BlockSize::new(BLOCK_SIZE).unwrap(),
        journal_slot: JournalSlot(0),
        journal_count: 1,
    };
    let vol = Arc::new(Volume::new(
        geo,
        services,
        InodeNumber(3),
        Arc::new(VecRindexSource::new(&[ri])),
    ));
    Harness {
        dev,
        space,
        withdraw,
        vol,
    }
}

fn inode() -> Inode {
    Inode::new(InodeNumber(20), 1000, 1000)
}

fn get_value(hx: &Harness, ip: &Inode, ea_type: EaType, name: &[u8]) -> Vec<u8> {
    let size = herd_eattr::get(&hx.vol, ip, ea_type, name, &mut []).unwrap();
    let mut buf = vec![0_u8; size];
    let copied = herd_eattr::get(&hx.vol, ip, ea_type, name, &mut buf).unwrap();
    assert_eq!(copied, size);
    buf
}

#[test]
fn stuffed_set_creates_one_block_and_round_trips() {
    let hx = harness();
    let mut ip = inode();

    herd_eattr::set(
        &hx.vol,
        &mut ip,
        EaType::User,
        b"foo",
        b"0123456789",
        SetFlags::default(),
    )
    .unwrap();

    assert!(ip.eattr.is_some());
    assert_eq!(ip.blocks, 1);
    assert!(ip.ctime > 0);
    assert_eq!(get_value(&hx, &ip, EaType::User, b"foo"), b"0123456789");

    // Listing is "user.foo\0".
    let size = herd_eattr::list(&hx.vol, &ip, &mut []).unwrap();
    assert_eq!(size, 9);
    let mut buf = vec![0_u8; size];
    herd_eattr::list(&hx.vol, &ip, &mut buf).unwrap();
    assert_eq!(&buf, b"user.foo\0");

    // Exactly one block left the free pool.
    assert_eq!(hx.space.totals(), (0, -1, 0));
}

#[test]
fn unstuffed_value_spans_data_blocks_and_round_trips() {
    let hx = harness();
    let mut ip = inode();

    let value: Vec<u8> = (0..1000_u32).map(|i| (i % 251) as u8).collect();
    herd_eattr::set(
        &hx.vol,
        &mut ip,
        EaType::User,
        b"big",
        &value,
        SetFlags::default(),
    )
    .unwrap();

    // One attribute block plus three data blocks (488-byte payloads).
    assert_eq!(ip.blocks, 4);
    assert_eq!(hx.space.totals(), (0, -4, 0));
    assert_eq!(get_value(&hx, &ip, EaType::User, b"big"), value);
}

#[test]
fn oversized_value_fails_before_any_allocation() {
    let hx = harness();
    let mut ip = inode();

    let value = vec![0xAA_u8; 70_000];
    let err = herd_eattr::set(
        &hx.vol,
        &mut ip,
        EaType::User,
        b"bar",
        &value,
        SetFlags::default(),
    )
    .unwrap_err();

    assert!(matches!(err, HerdError::OutOfRange(_)));
    assert!(ip.eattr.is_none());
    assert_eq!(ip.blocks, 0);
    assert_eq!(hx.space.totals(), (0, 0, 0));
}

#[test]
fn create_flag_on_existing_name_fails_without_change() {
    let hx = harness();
    let mut ip = inode();

    herd_eattr::set(
        &hx.vol,
        &mut ip,
        EaType::User,
        b"foo",
        b"before",
        SetFlags::default(),
    )
    .unwrap();

    let err = herd_eattr::set(
        &hx.vol,
        &mut ip,
        EaType::User,
        b"foo",
        b"after",
        SetFlags {
            create: true,
            replace: false,
        },
    )
    .unwrap_err();
    assert!(matches!(err, HerdError::AlreadyExists));
    assert_eq!(get_value(&hx, &ip, EaType::User, b"foo"), b"before");
}

#[test]
fn replace_flag_on_missing_name_fails() {
    let hx = harness();
    let mut ip = inode();

    let flags = SetFlags {
        create: false,
        replace: true,
    };
    let err = herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"foo", b"x", flags).unwrap_err();
    assert!(matches!(err, HerdError::NotFound));

    // Same once a store exists but the name does not.
    herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"other", b"x", SetFlags::default()).unwrap();
    let err = herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"foo", b"y", flags).unwrap_err();
    assert!(matches!(err, HerdError::NotFound));
}

#[test]
fn replace_reuses_block_space_in_place() {
    let hx = harness();
    let mut ip = inode();

    for value in [&b"first"[..], b"second-longer", b"3rd"] {
        herd_eattr::set(
            &hx.vol,
            &mut ip,
            EaType::User,
            b"foo",
            value,
            SetFlags::default(),
        )
        .unwrap();
        assert_eq!(get_value(&hx, &ip, EaType::User, b"foo"), value);
    }

    // Replacements landed in the primary block; nothing new allocated.
    assert_eq!(ip.blocks, 1);

    let size = herd_eattr::list(&hx.vol, &ip, &mut []).unwrap();
    assert_eq!(size, 9, "replaced attribute must be listed once");
}

#[test]
fn remove_stuffed_attribute_clears_every_view() {
    let hx = harness();
    let mut ip = inode();

    herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"one", b"1", SetFlags::default()).unwrap();
    herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"two", b"2", SetFlags::default()).unwrap();

    herd_eattr::remove(&hx.vol, &mut ip, EaType::User, b"one").unwrap();

    assert!(
        herd_eattr::find(&hx.vol, &ip, EaType::User, b"one")
            .unwrap()
            .is_none()
    );
    assert!(matches!(
        herd_eattr::get(&hx.vol, &ip, EaType::User, b"one", &mut []),
        Err(HerdError::NotFound)
    ));

    let size = herd_eattr::list(&hx.vol, &ip, &mut []).unwrap();
    let mut buf = vec![0_u8; size];
    herd_eattr::list(&hx.vol, &ip, &mut buf).unwrap();
    assert_eq!(&buf, b"user.two\0");

    assert!(matches!(
        herd_eattr::remove(&hx.vol, &mut ip, EaType::User, b"one"),
        Err(HerdError::NotFound)
    ));
}

#[test]
fn remove_unstuffed_returns_data_blocks_to_free_state() {
    let hx = harness();
    let mut ip = inode();

    let value = vec![0x5A_u8; 1000];
    herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"big", &value, SetFlags::default()).unwrap();

    let visit = herd_eattr::walk(&hx.vol, &ip)
        .unwrap()
        .map(Result::unwrap)
        .find(|v| !v.header.is_unused() && v.name() == b"big")
        .unwrap();
    let data_blocks = visit.pointers();
    assert_eq!(data_blocks.len(), 3);
    drop(visit);

    herd_eattr::remove(&hx.vol, &mut ip, EaType::User, b"big").unwrap();

    for block in data_blocks {
        assert_eq!(hx.vol.block_state(block).unwrap(), BLKST_FREE);
    }
    assert_eq!(ip.blocks, 1, "only the attribute block remains");
    assert_eq!(hx.space.totals(), (0, -1, 0));
    assert!(
        herd_eattr::find(&hx.vol, &ip, EaType::User, b"big")
            .unwrap()
            .is_none()
    );
}

#[test]
fn replacing_unstuffed_with_stuffed_frees_old_data_blocks() {
    let hx = harness();
    let mut ip = inode();

    let big = vec![0x11_u8; 1000];
    herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"v", &big, SetFlags::default()).unwrap();
    assert_eq!(ip.blocks, 4);

    herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"v", b"tiny", SetFlags::default()).unwrap();
    assert_eq!(get_value(&hx, &ip, EaType::User, b"v"), b"tiny");
    assert_eq!(ip.blocks, 1, "old value's data blocks must be freed");
    assert_eq!(hx.space.totals(), (0, -1, 0));
}

#[test]
fn fork_grows_through_an_indirect_block() {
    let hx = harness();
    let mut ip = inode();

    // 400-byte values: one record fills a whole 488-byte attribute block,
    // so each additional attribute forces a new block.
    let names: Vec<Vec<u8>> = (0..3).map(|i| format!("a{i}").into_bytes()).collect();
    for name in &names {
        let value = vec![name[1]; 400];
        herd_eattr::set(&hx.vol, &mut ip, EaType::User, name, &value, SetFlags::default())
            .unwrap();
    }

    assert!(ip.flags.contains(InodeFlags::EA_INDIRECT));
    for name in &names {
        assert_eq!(get_value(&hx, &ip, EaType::User, name), vec![name[1]; 400]);
    }

    let size = herd_eattr::list(&hx.vol, &ip, &mut []).unwrap();
    assert_eq!(size, names.len() * "user.a0\0".len());

    // Diagnostic copy sees the indirect root plus one block per attribute.
    let raw = herd_eattr::raw_blocks(&hx.vol, &ip).unwrap();
    assert_eq!(raw.len(), 1 + names.len());
}

#[test]
fn namespaces_are_distinct_and_prefixed() {
    let hx = harness();
    let mut ip = inode();

    herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"x", b"u", SetFlags::default()).unwrap();
    herd_eattr::set(&hx.vol, &mut ip, EaType::System, b"x", b"s", SetFlags::default()).unwrap();
    herd_eattr::set(&hx.vol, &mut ip, EaType::Security, b"x", b"c", SetFlags::default()).unwrap();

    assert_eq!(get_value(&hx, &ip, EaType::User, b"x"), b"u");
    assert_eq!(get_value(&hx, &ip, EaType::System, b"x"), b"s");
    assert_eq!(get_value(&hx, &ip, EaType::Security, b"x"), b"c");

    let size = herd_eattr::list(&hx.vol, &ip, &mut []).unwrap();
    let mut buf = vec![0_u8; size];
    herd_eattr::list(&hx.vol, &ip, &mut buf).unwrap();
    let listing = String::from_utf8(buf).unwrap();
    assert!(listing.contains("user.x\0"));
    assert!(listing.contains("system.x\0"));
    assert!(listing.contains("security.x\0"));
}

#[test]
fn list_two_call_protocol_rejects_short_buffers() {
    let hx = harness();
    let mut ip = inode();

    herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"name", b"v", SetFlags::default()).unwrap();

    let size = herd_eattr::list(&hx.vol, &ip, &mut []).unwrap();
    assert_eq!(size, "user.name\0".len());

    let mut short = vec![0_u8; size - 1];
    assert!(matches!(
        herd_eattr::list(&hx.vol, &ip, &mut short),
        Err(HerdError::OutOfRange(_))
    ));

    let mut small = vec![0_u8; 2];
    assert!(matches!(
        herd_eattr::get(&hx.vol, &ip, EaType::User, b"name", &mut small),
        Err(HerdError::OutOfRange(_))
    ));
}

#[test]
fn immutable_and_append_only_are_enforced() {
    let hx = harness();
    let mut ip = inode();

    herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"keep", b"v", SetFlags::default()).unwrap();

    ip.flags.insert(InodeFlags::IMMUTABLE);
    assert!(matches!(
        herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"new", b"v", SetFlags::default()),
        Err(HerdError::PermissionDenied)
    ));
    assert!(matches!(
        herd_eattr::remove(&hx.vol, &mut ip, EaType::User, b"keep"),
        Err(HerdError::PermissionDenied)
    ));
    ip.flags.remove(InodeFlags::IMMUTABLE);

    ip.flags.insert(InodeFlags::APPEND_ONLY);
    // Appending a new attribute is allowed; replacing or removing is not.
    herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"new", b"v", SetFlags::default()).unwrap();
    assert!(matches!(
        herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"keep", b"w", SetFlags::default()),
        Err(HerdError::PermissionDenied)
    ));
    assert!(matches!(
        herd_eattr::remove(&hx.vol, &mut ip, EaType::User, b"keep"),
        Err(HerdError::PermissionDenied)
    ));
}

#[test]
fn empty_and_oversized_names_are_rejected() {
    let hx = harness();
    let mut ip = inode();

    assert!(matches!(
        herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"", b"v", SetFlags::default()),
        Err(HerdError::InvalidArgument(_))
    ));
    let long = vec![b'n'; 256];
    assert!(matches!(
        herd_eattr::set(&hx.vol, &mut ip, EaType::User, &long, b"v", SetFlags::default()),
        Err(HerdError::InvalidArgument(_))
    ));
    assert!(matches!(
        herd_eattr::get(&hx.vol, &ip, EaType::User, b"", &mut []),
        Err(HerdError::InvalidArgument(_))
    ));
}

#[test]
fn find_without_attribute_store_is_none_not_error() {
    let hx = harness();
    let ip = inode();

    assert!(
        herd_eattr::find(&hx.vol, &ip, EaType::User, b"foo")
            .unwrap()
            .is_none()
    );
    assert_eq!(herd_eattr::list(&hx.vol, &ip, &mut []).unwrap(), 0);
    assert!(herd_eattr::raw_blocks(&hx.vol, &ip).unwrap().is_empty());
}

#[test]
fn dealloc_all_returns_every_block() {
    let hx = harness();
    let mut ip = inode();

    let big = vec![0x42_u8; 1000];
    herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"big", &big, SetFlags::default()).unwrap();
    for i in 0..3 {
        let name = format!("fill{i}").into_bytes();
        herd_eattr::set(
            &hx.vol,
            &mut ip,
            EaType::User,
            &name,
            &vec![b'x'; 400],
            SetFlags::default(),
        )
        .unwrap();
    }
    assert!(ip.flags.contains(InodeFlags::EA_INDIRECT));
    assert!(ip.blocks > 4);

    herd_eattr::dealloc_all(&hx.vol, &mut ip).unwrap();

    assert!(ip.eattr.is_none());
    assert!(!ip.flags.contains(InodeFlags::EA_INDIRECT));
    assert_eq!(ip.blocks, 0);
    assert_eq!(hx.space.totals(), (0, 0, 0));

    // The group's bitmap agrees with its header again.
    let rgd = hx.vol.lookup_rgrp(BlockNumber(100)).unwrap();
    let guard = rgd.checkout().unwrap();
    assert_eq!(guard.header().free, 1024);
    guard.verify().unwrap();
}

#[test]
fn acl_chmod_rewrites_value_and_mode_in_place() {
    let hx = harness();
    let mut ip = inode();
    ip.mode = 0o100_644;

    herd_eattr::set(
        &hx.vol,
        &mut ip,
        EaType::Security,
        b"acl",
        b"AAAABBBB",
        SetFlags::default(),
    )
    .unwrap();
    let loc = herd_eattr::find(&hx.vol, &ip, EaType::Security, b"acl")
        .unwrap()
        .unwrap();

    herd_eattr::acl_chmod(&hx.vol, &mut ip, &loc, 0o100_600, b"CCCCDDDD").unwrap();

    assert_eq!(ip.mode, 0o100_600);
    assert_eq!(get_value(&hx, &ip, EaType::Security, b"acl"), b"CCCCDDDD");

    // Length changes are rejected.
    assert!(matches!(
        herd_eattr::acl_chmod(&hx.vol, &mut ip, &loc, 0o100_600, b"short"),
        Err(HerdError::InvalidArgument(_))
    ));
}

#[test]
fn repack_is_recognized_but_unsupported() {
    let hx = harness();
    let ip = inode();
    assert!(matches!(
        herd_eattr::repack(&hx.vol, &ip),
        Err(HerdError::Unsupported)
    ));
}

#[test]
fn malformed_record_chain_withdraws_the_volume() {
    let hx = harness();
    let mut ip = inode();

    herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"foo", b"v", SetFlags::default()).unwrap();
    let root = ip.eattr.unwrap();

    // Zero the first record's length on disk.
    let mut bytes = hx.dev.read_block(root).unwrap().into_inner();
    write_le_u32(&mut bytes, META_HEADER_SIZE, 0);
    hx.dev.write_block(root, &bytes).unwrap();

    let err = herd_eattr::find(&hx.vol, &ip, EaType::User, b"foo").unwrap_err();
    assert!(err.is_fatal());
    assert!(hx.withdraw.is_withdrawn());

    // Further mutation attempts fail fast.
    assert!(matches!(
        herd_eattr::set(&hx.vol, &mut ip, EaType::User, b"bar", b"v", SetFlags::default()),
        Err(HerdError::Withdrawn)
    ));
}
