//! End-to-end scenarios driven through the syscall surface.

use cutefs::mkfs::{format, FormatOptions};
use cutefs::{Errno, Ext2Fs, OpenFlags, ProcCtx, SeekWhence};

const BS: usize = 1024;

fn fresh() -> (Ext2Fs, ProcCtx) {
    let fs = Ext2Fs::mount(format(2 << 20, &FormatOptions::default()));
    (fs, ProcCtx::new())
}

fn fresh_with(len: usize, inodes_per_group: u32) -> (Ext2Fs, ProcCtx) {
    let opts = FormatOptions {
        inodes_per_group,
        ..FormatOptions::default()
    };
    (Ext2Fs::mount(format(len, &opts)), ProcCtx::new())
}

#[test]
fn write_then_read_back() {
    let (fs, mut ctx) = fresh();
    let free_blocks = fs.free_blocks();
    let free_inodes = fs.free_inodes();

    let fd = fs
        .open(&mut ctx, b"/a", OpenFlags::CREAT | OpenFlags::WRONLY)
        .unwrap();
    let data = vec![0xaau8; 4 * BS];
    assert_eq!(fs.write(&ctx, fd, &data).unwrap(), 4 * BS);
    fs.close(&mut ctx, fd).unwrap();

    let fd = fs.open(&mut ctx, b"/a", OpenFlags::RDONLY).unwrap();
    let mut back = vec![0u8; 4 * BS];
    assert_eq!(fs.read(&ctx, fd, &mut back).unwrap(), 4 * BS);
    assert!(back.iter().all(|&b| b == 0xaa));
    // The offset reached the end: further reads return nothing.
    assert_eq!(fs.read(&ctx, fd, &mut back).unwrap(), 0);
    fs.close(&mut ctx, fd).unwrap();

    assert_eq!(fs.free_blocks(), free_blocks - 4);
    assert_eq!(fs.free_inodes(), free_inodes - 1);
    let st = fs.stat(&ctx, b"/a").unwrap();
    assert_eq!(st.st_size, 4 * BS as u64);
    assert_eq!(st.st_nlink, 1);
}

#[test]
fn directories_and_hard_links() {
    let (fs, mut ctx) = fresh();
    let fd = fs
        .open(&mut ctx, b"/a", OpenFlags::CREAT | OpenFlags::WRONLY)
        .unwrap();
    fs.write(&ctx, fd, b"payload").unwrap();
    fs.close(&mut ctx, fd).unwrap();

    fs.mkdir(&ctx, b"/dir").unwrap();
    let dir_ino = fs.stat(&ctx, b"/dir").unwrap().st_ino;
    assert_eq!(fs.stat(&ctx, b"/dir/.").unwrap().st_ino, dir_ino);
    assert_eq!(fs.stat(&ctx, b"/dir/..").unwrap().st_ino, 2);
    assert_eq!(fs.stat(&ctx, b"/").unwrap().st_ino, 2);
    assert_eq!(fs.stat(&ctx, b"/.").unwrap().st_ino, 2);
    assert_eq!(fs.stat(&ctx, b"/..").unwrap().st_ino, 2);

    fs.link(&ctx, b"/a", b"/dir/b").unwrap();
    let a = fs.stat(&ctx, b"/a").unwrap();
    let b = fs.stat(&ctx, b"/dir/b").unwrap();
    assert_eq!(a.st_ino, b.st_ino);
    assert_eq!(a.st_nlink, 2);

    // Snapshot after the directory exists: deleting both names must come
    // back here.
    let free_blocks = fs.free_blocks();
    let free_inodes = fs.free_inodes();

    fs.unlink(&ctx, b"/a").unwrap();
    assert_eq!(fs.stat(&ctx, b"/a").err(), Some(Errno::ENOENT));
    let b = fs.stat(&ctx, b"/dir/b").unwrap();
    assert_eq!(b.st_nlink, 1);
    let fd = fs.open(&mut ctx, b"/dir/b", OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(&ctx, fd, &mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"payload");
    fs.close(&mut ctx, fd).unwrap();

    fs.unlink(&ctx, b"/dir/b").unwrap();
    assert_eq!(fs.free_blocks(), free_blocks + 1);
    assert_eq!(fs.free_inodes(), free_inodes + 1);

    assert_eq!(fs.unlink(&ctx, b"/dir").err(), Some(Errno::EISDIR));
}

#[test]
fn chdir_and_relative_paths() {
    let (fs, mut ctx) = fresh();
    fs.mkdir(&ctx, b"/dir").unwrap();
    fs.chdir(&mut ctx, b"/dir").unwrap();
    let fd = fs
        .open(&mut ctx, b"x", OpenFlags::CREAT | OpenFlags::WRONLY)
        .unwrap();
    fs.close(&mut ctx, fd).unwrap();
    assert!(fs.stat(&ctx, b"/dir/x").is_ok());
    fs.chdir(&mut ctx, b"..").unwrap();
    assert!(fs.stat(&ctx, b"dir/x").is_ok());

    let fd = fs
        .open(&mut ctx, b"/plain", OpenFlags::CREAT | OpenFlags::RDONLY)
        .unwrap();
    fs.close(&mut ctx, fd).unwrap();
    assert_eq!(fs.chdir(&mut ctx, b"/plain").err(), Some(Errno::ENOTDIR));
    assert_eq!(fs.stat(&ctx, b"/plain/x").err(), Some(Errno::ENOTDIR));
}

#[test]
fn lseek_semantics() {
    let (fs, mut ctx) = fresh();
    // Scenario: descriptor 0 opened on the root directory.
    let fd = fs.open(&mut ctx, b"/", OpenFlags::RDONLY).unwrap();
    assert_eq!(fd, 0);
    assert_eq!(fs.lseek(&ctx, fd, 10, SeekWhence::Set).unwrap(), 10);
    assert_eq!(fs.lseek(&ctx, fd, 5, SeekWhence::Cur).unwrap(), 15);
    let dir_size = fs.stat(&ctx, b"/").unwrap().st_size;
    assert_eq!(fs.lseek(&ctx, fd, 0, SeekWhence::End).unwrap(), dir_size);

    // Reading a directory through the descriptor is refused.
    assert_eq!(fs.read(&ctx, fd, &mut [0u8; 8]).err(), Some(Errno::EISDIR));

    assert_eq!(
        fs.lseek(&ctx, fd, u64::MAX / 2, SeekWhence::Set).unwrap(),
        u64::MAX / 2
    );
    assert_eq!(
        fs.lseek(&ctx, fd, u64::MAX / 2 + 2, SeekWhence::Cur).err(),
        Some(Errno::EOVERFLOW)
    );
    assert_eq!(
        fs.lseek(&ctx, 99, 0, SeekWhence::Set).err(),
        Some(Errno::EBADF)
    );
}

#[test]
fn open_gates() {
    let (fs, mut ctx) = fresh();
    // An access mode is mandatory.
    assert_eq!(
        fs.open(&mut ctx, b"/", OpenFlags::from_bits(0)).err(),
        Some(Errno::EINVAL)
    );
    // Writing a directory is refused at open time.
    assert_eq!(
        fs.open(&mut ctx, b"/", OpenFlags::WRONLY).err(),
        Some(Errno::EISDIR)
    );
    assert_eq!(
        fs.open(&mut ctx, b"/missing", OpenFlags::RDONLY).err(),
        Some(Errno::ENOENT)
    );

    // A descriptor only honors its own access mode.
    let fd = fs
        .open(&mut ctx, b"/f", OpenFlags::CREAT | OpenFlags::WRONLY)
        .unwrap();
    assert_eq!(fs.read(&ctx, fd, &mut [0u8; 4]).err(), Some(Errno::EBADF));
    fs.close(&mut ctx, fd).unwrap();
    let fd = fs.open(&mut ctx, b"/f", OpenFlags::RDONLY).unwrap();
    assert_eq!(fs.write(&ctx, fd, &[0u8; 4]).err(), Some(Errno::EBADF));
    fs.close(&mut ctx, fd).unwrap();
    assert_eq!(fs.close(&mut ctx, fd).err(), Some(Errno::EBADF));
}

#[test]
fn append_truncate_and_dup() {
    let (fs, mut ctx) = fresh();
    let free_blocks = fs.free_blocks();
    let fd = fs
        .open(&mut ctx, b"/log", OpenFlags::CREAT | OpenFlags::WRONLY)
        .unwrap();
    fs.write(&ctx, fd, &[1u8; 2000]).unwrap();
    fs.close(&mut ctx, fd).unwrap();

    let fd = fs
        .open(&mut ctx, b"/log", OpenFlags::WRONLY | OpenFlags::APPEND)
        .unwrap();
    fs.write(&ctx, fd, &[2u8; 100]).unwrap();
    fs.close(&mut ctx, fd).unwrap();
    assert_eq!(fs.stat(&ctx, b"/log").unwrap().st_size, 2100);

    // `dup` shares one offset between two descriptors.
    let fd = fs.open(&mut ctx, b"/log", OpenFlags::RDONLY).unwrap();
    let dup = fs.dup(&mut ctx, fd).unwrap();
    assert_ne!(fd, dup);
    fs.lseek(&ctx, fd, 2000, SeekWhence::Set).unwrap();
    let mut buf = [0u8; 100];
    assert_eq!(fs.read(&ctx, dup, &mut buf).unwrap(), 100);
    assert!(buf.iter().all(|&b| b == 2));
    fs.close(&mut ctx, fd).unwrap();
    // The entry survives until the last descriptor closes.
    assert_eq!(fs.lseek(&ctx, dup, 0, SeekWhence::Cur).unwrap(), 2100);
    fs.close(&mut ctx, dup).unwrap();

    let fd = fs
        .open(&mut ctx, b"/log", OpenFlags::WRONLY | OpenFlags::TRUNC)
        .unwrap();
    fs.close(&mut ctx, fd).unwrap();
    assert_eq!(fs.stat(&ctx, b"/log").unwrap().st_size, 0);
    assert_eq!(fs.free_blocks(), free_blocks);
}

#[test]
fn exclusive_creation_census() {
    // Base-36 names `00`..`zz`, then re-creation with O_EXCL refused for
    // every one of them. 2 KiB blocks: 1296 records outgrow what a dozen
    // 1 KiB directory blocks can hold.
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let opts = FormatOptions {
        block_size: 2048,
        inodes_per_group: 1536,
        ..FormatOptions::default()
    };
    let fs = Ext2Fs::mount(format(8 << 20, &opts));
    let mut ctx = ProcCtx::new();
    let free_blocks = fs.free_blocks();
    let free_inodes = fs.free_inodes();

    for hi in DIGITS {
        for lo in DIGITS {
            let name = [b'/', *hi, *lo];
            let fd = fs
                .open(&mut ctx, &name, OpenFlags::CREAT | OpenFlags::WRONLY)
                .unwrap();
            fs.close(&mut ctx, fd).unwrap();
        }
    }
    assert_eq!(fs.free_inodes(), free_inodes - 36 * 36);

    for hi in DIGITS {
        for lo in DIGITS {
            let name = [b'/', *hi, *lo];
            assert_eq!(
                fs.open(
                    &mut ctx,
                    &name,
                    OpenFlags::CREAT | OpenFlags::EXCL | OpenFlags::WRONLY
                )
                .err(),
                Some(Errno::EEXIST),
                "{}",
                String::from_utf8_lossy(&name)
            );
        }
    }

    for hi in DIGITS {
        for lo in DIGITS {
            let name = [b'/', *hi, *lo];
            fs.unlink(&ctx, &name).unwrap();
        }
    }
    assert_eq!(fs.free_inodes(), free_inodes);
    assert_eq!(fs.free_blocks(), free_blocks);
}

#[test]
fn filling_the_volume() {
    // A small volume: keep writing 4 KiB chunks into successively named
    // files until space runs out.
    let (fs, mut ctx) = fresh_with(400 << 10, 64);
    let mut victim = None;
    'outer: for i in 0..2000u32 {
        let name = format!("/f{i}").into_bytes();
        let fd = fs
            .open(&mut ctx, &name, OpenFlags::CREAT | OpenFlags::WRONLY)
            .unwrap();
        let mut written = 0u64;
        for _ in 0..3 {
            match fs.write(&ctx, fd, &[0x5a; 4096]) {
                Ok(n) => {
                    written += n as u64;
                    if n < 4096 {
                        // Partial commit: the very next write must fail
                        // cleanly.
                        assert_eq!(fs.write(&ctx, fd, &[0x5a; 4096]).err(), Some(Errno::ENOSPC));
                        victim = Some((name, fd, written));
                        break 'outer;
                    }
                }
                Err(Errno::ENOSPC) => {
                    victim = Some((name, fd, written));
                    break 'outer;
                }
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        fs.close(&mut ctx, fd).unwrap();
    }

    let (name, fd, written) = victim.expect("the volume never filled up");
    // The failed file's size covers exactly the bytes that were committed.
    assert_eq!(fs.fstat(&ctx, fd).unwrap().st_size, written);
    assert_eq!(fs.stat(&ctx, &name).unwrap().st_size, written);
    assert_eq!(fs.free_blocks(), 0);
    // Still failing, still no state change.
    let before = fs.fstat(&ctx, fd).unwrap();
    assert_eq!(fs.write(&ctx, fd, &[0x5a; 4096]).err(), Some(Errno::ENOSPC));
    assert_eq!(fs.fstat(&ctx, fd).unwrap(), before);
    fs.close(&mut ctx, fd).unwrap();
}

#[test]
fn directory_at_its_direct_block_cap() {
    // A directory's content is bounded by the 12 direct blocks like any
    // other file. Once its records fill them, creation inside it reports
    // ENOSPC even though the volume itself still has room.
    let (fs, mut ctx) = fresh_with(2 << 20, 1024);
    fs.mkdir(&ctx, b"/d").unwrap();
    let mut created = 0u32;
    let full_err = loop {
        let name = format!("/d/f{created:04}").into_bytes();
        match fs.open(&mut ctx, &name, OpenFlags::CREAT | OpenFlags::WRONLY) {
            Ok(fd) => {
                fs.close(&mut ctx, fd).unwrap();
                created += 1;
            }
            Err(e) => break e,
        }
        assert!(created < 1500, "the directory never filled up");
    };
    assert_eq!(full_err, Errno::ENOSPC);
    assert!(created > 700);
    assert!(fs.free_blocks() > 0);
    assert!(fs.free_inodes() > 0);
    assert_eq!(fs.stat(&ctx, b"/d").unwrap().st_size, (12 * BS) as u64);

    // A link source outside the full directory.
    let fd = fs
        .open(&mut ctx, b"/a", OpenFlags::CREAT | OpenFlags::WRONLY)
        .unwrap();
    fs.close(&mut ctx, fd).unwrap();

    // Every creation-shaped call on the full directory fails the same
    // way, and none of them leaks an allocation.
    let free_blocks = fs.free_blocks();
    let free_inodes = fs.free_inodes();
    let dir_links = fs.stat(&ctx, b"/d").unwrap().st_nlink;
    assert_eq!(
        fs.open(&mut ctx, b"/d/straggler", OpenFlags::CREAT | OpenFlags::WRONLY)
            .err(),
        Some(Errno::ENOSPC)
    );
    assert_eq!(fs.mkdir(&ctx, b"/d/sub").err(), Some(Errno::ENOSPC));
    assert_eq!(fs.link(&ctx, b"/a", b"/d/lnk").err(), Some(Errno::ENOSPC));
    assert_eq!(fs.free_blocks(), free_blocks);
    assert_eq!(fs.free_inodes(), free_inodes);
    assert_eq!(fs.stat(&ctx, b"/d").unwrap().st_nlink, dir_links);
    assert_eq!(fs.stat(&ctx, b"/a").unwrap().st_nlink, 1);
    assert_eq!(fs.stat(&ctx, b"/d/lnk").err(), Some(Errno::ENOENT));
}

#[test]
fn name_length_limits() {
    let (fs, mut ctx) = fresh();
    let mut path = vec![b'/'];
    path.extend_from_slice(&[b'n'; 254]);
    let fd = fs
        .open(&mut ctx, &path, OpenFlags::CREAT | OpenFlags::WRONLY)
        .unwrap();
    fs.close(&mut ctx, fd).unwrap();
    assert!(fs.stat(&ctx, &path).is_ok());

    let mut path = vec![b'/'];
    path.extend_from_slice(&[b'n'; 255]);
    assert_eq!(
        fs.open(&mut ctx, &path, OpenFlags::CREAT | OpenFlags::WRONLY)
            .err(),
        Some(Errno::ENAMETOOLONG)
    );
}

#[test]
fn write_cap_is_twelve_blocks() {
    let (fs, mut ctx) = fresh();
    let fd = fs
        .open(&mut ctx, b"/big", OpenFlags::CREAT | OpenFlags::WRONLY)
        .unwrap();
    let data = vec![1u8; 12 * BS + 1];
    // Exactly twelve blocks commit, the excess byte is clipped.
    assert_eq!(fs.write(&ctx, fd, &data).unwrap(), 12 * BS);
    // The offset now sits at the cap: one more byte cannot be placed.
    assert_eq!(fs.write(&ctx, fd, &[1u8]).err(), Some(Errno::EFBIG));
    fs.close(&mut ctx, fd).unwrap();
    assert_eq!(fs.stat(&ctx, b"/big").unwrap().st_size, (12 * BS) as u64);
}

#[test]
fn counters_stay_consistent() {
    let (fs, mut ctx) = fresh();
    let check = |fs: &Ext2Fs| {
        let mut blocks = 0u32;
        let mut inodes = 0u32;
        for g in 0..fs.groups_count() {
            blocks += u32::from(fs.group_desc(g).bg_free_blocks_count);
            inodes += u32::from(fs.group_desc(g).bg_free_inodes_count);
        }
        assert_eq!(blocks, fs.free_blocks());
        assert_eq!(inodes, fs.free_inodes());
    };

    check(&fs);
    fs.mkdir(&ctx, b"/d").unwrap();
    check(&fs);
    let fd = fs
        .open(&mut ctx, b"/d/f", OpenFlags::CREAT | OpenFlags::RDWR)
        .unwrap();
    fs.write(&ctx, fd, &[0u8; 3000]).unwrap();
    check(&fs);
    fs.close(&mut ctx, fd).unwrap();
    fs.unlink(&ctx, b"/d/f").unwrap();
    check(&fs);

    // Remounting the same image sees the flushed counters.
    let sb = fs.superblock();
    let fs2 = Ext2Fs::mount(fs.unmount());
    assert_eq!(fs2.free_blocks(), sb.s_free_blocks_count);
    assert_eq!(fs2.free_inodes(), sb.s_free_inodes_count);
}

#[test]
fn read_dir_lists_live_entries() {
    let (fs, mut ctx) = fresh();
    fs.mkdir(&ctx, b"/d").unwrap();
    for name in [b"/d/x".as_slice(), b"/d/y", b"/d/z"] {
        let fd = fs
            .open(&mut ctx, name, OpenFlags::CREAT | OpenFlags::WRONLY)
            .unwrap();
        fs.close(&mut ctx, fd).unwrap();
    }
    fs.unlink(&ctx, b"/d/y").unwrap();
    let names: Vec<_> = fs
        .read_dir(&ctx, b"/d")
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(names, vec![b".".to_vec(), b"..".to_vec(), b"x".to_vec(), b"z".to_vec()]);
    assert_eq!(fs.read_dir(&ctx, b"/d/x").err(), Some(Errno::ENOTDIR));
}
