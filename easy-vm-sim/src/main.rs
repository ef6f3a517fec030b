use clap::{value_parser, Arg, ArgMatches, Command};
use easy_vm::{
    ExecutableLoader, ExecutableReader, MemoryLoader, NoffHeader, ReplacementPolicy, Segment,
    VirtAddr, VirtualMemory, VmConfig, VmError, VmStats, PAGE_SIZE,
};
use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

/// An executable stored in a host file.
struct ExecutableFile(Mutex<File>);

impl ExecutableReader for ExecutableFile {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> easy_vm::Result<usize> {
        let mut file = self.0.lock().map_err(|_| VmError::Io { offset })?;
        file.seek(SeekFrom::Start(offset as u64))
            .map_err(|_| VmError::Io { offset })?;
        let mut done = 0;
        while done < buf.len() {
            match file.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(_) => return Err(VmError::Io { offset: offset + done }),
            }
        }
        Ok(done)
    }
}

/// Loader resolving program names against a host directory.
struct HostLoader {
    root: PathBuf,
}

impl ExecutableLoader for HostLoader {
    fn open(&self, path: &str) -> easy_vm::Result<Arc<dyn ExecutableReader>> {
        let file = File::open(self.root.join(path)).map_err(|_| VmError::NotFound)?;
        Ok(Arc::new(ExecutableFile(Mutex::new(file))))
    }
}

fn main() {
    env_logger::init();
    let matches = Command::new("easy-vm-sim")
        .about("Packs NOFF programs and runs workloads on the virtual memory core")
        .subcommand_required(true)
        .subcommand(
            Command::new("pack")
                .about("Build a NOFF image from raw code and data")
                .arg(
                    Arg::new("code")
                        .long("code")
                        .takes_value(true)
                        .required(true)
                        .help("Raw code bytes, loaded at virtual address 0"),
                )
                .arg(
                    Arg::new("data")
                        .long("data")
                        .takes_value(true)
                        .help("Initialized data, placed right after the code"),
                )
                .arg(
                    Arg::new("bss")
                        .long("bss")
                        .takes_value(true)
                        .default_value("0")
                        .value_parser(value_parser!(u32))
                        .help("Size of the uninitialized data segment"),
                )
                .arg(
                    Arg::new("output")
                        .short('o')
                        .long("output")
                        .takes_value(true)
                        .required(true),
                ),
        )
        .subcommand(
            Command::new("run")
                .about("Run the shared-memory fork workload")
                .arg(
                    Arg::new("program")
                        .short('p')
                        .long("program")
                        .takes_value(true)
                        .help("NOFF image to run instead of a built-in one"),
                )
                .arg(
                    Arg::new("frames")
                        .short('f')
                        .long("frames")
                        .takes_value(true)
                        .default_value("32")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("children")
                        .short('c')
                        .long("children")
                        .takes_value(true)
                        .default_value("10")
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("touches")
                        .long("touches")
                        .takes_value(true)
                        .default_value("0")
                        .value_parser(value_parser!(usize))
                        .help("Random private page accesses per child, to force evictions"),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .takes_value(true)
                        .default_value("0")
                        .value_parser(value_parser!(u64)),
                ),
        )
        .get_matches();
    let result = match matches.subcommand() {
        Some(("pack", sub)) => pack(sub).map_err(|err| err.to_string()),
        Some(("run", sub)) => run(sub).map_err(|err| err.to_string()),
        _ => unreachable!(),
    };
    if let Err(err) = result {
        eprintln!("easy-vm-sim: {}", err);
        std::process::exit(1);
    }
}

fn pack(matches: &ArgMatches) -> std::io::Result<()> {
    let code = fs::read(matches.value_of("code").unwrap())?;
    let data = match matches.value_of("data") {
        Some(path) => fs::read(path)?,
        None => Vec::new(),
    };
    let bss = *matches.get_one::<u32>("bss").unwrap();
    let image = build_image(&code, &data, bss);
    let mut output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(matches.value_of("output").unwrap())?;
    output.write_all(&image)?;
    info!(
        "packed {} bytes of code, {} of data, {} of bss",
        code.len(),
        data.len(),
        bss
    );
    Ok(())
}

/// Lay out a NOFF image: header, then code at virtual 0, data right after
/// it, then the uninitialized segment.
fn build_image(code: &[u8], data: &[u8], bss: u32) -> Vec<u8> {
    let code_off = easy_vm::noff::NOFF_HEADER_SIZE as u32;
    let code_len = code.len() as u32;
    let data_len = data.len() as u32;
    let header = NoffHeader::new(
        Segment::new(0, code_off, code_len),
        Segment::new(code_len, code_off + code_len, data_len),
        Segment::new(code_len + data_len, 0, bss),
    );
    let mut image = header.to_bytes().to_vec();
    image.extend_from_slice(code);
    image.extend_from_slice(data);
    image
}

fn run(matches: &ArgMatches) -> Result<(), VmError> {
    let config = VmConfig::new(
        *matches.get_one::<usize>("frames").unwrap(),
        ReplacementPolicy::Fifo,
    );
    let (loader, path): (Arc<dyn ExecutableLoader>, String) = match matches.value_of("program") {
        Some(program) => {
            let program = PathBuf::from(program);
            let root = program.parent().map(PathBuf::from).unwrap_or_default();
            let name = program
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let loader: Arc<dyn ExecutableLoader> = Arc::new(HostLoader { root });
            (loader, name)
        }
        None => {
            let loader = MemoryLoader::new();
            loader.insert("shmtest", build_image(&[0u8; 4 * PAGE_SIZE], &[1u8; 64], 256));
            let loader: Arc<dyn ExecutableLoader> = Arc::new(loader);
            (loader, String::from("shmtest"))
        }
    };
    let workload = Workload {
        children: *matches.get_one::<usize>("children").unwrap(),
        touches: *matches.get_one::<usize>("touches").unwrap(),
        seed: *matches.get_one::<u64>("seed").unwrap(),
    };
    let vm = Arc::new(VirtualMemory::new(loader, config));
    let report = workload.run(&vm, &path)?;
    println!(
        "shm[0] : {}\nshm[1] : {}\nshm[2] : {}",
        report.fields[0], report.fields[1], report.fields[2]
    );
    println!(
        "page faults {}, evictions {}, resident frames {}, pinned frames {}",
        report.stats.page_faults,
        report.stats.evictions,
        report.stats.resident_frames,
        report.stats.pinned_frames
    );
    Ok(())
}

/// Three shared integers and a number of forked children updating them.
struct Workload {
    children: usize,
    touches: usize,
    seed: u64,
}

struct Report {
    fields: [u32; 3],
    stats: VmStats,
}

const INITIAL_FIELDS: [u32; 3] = [1000, 100000, 1];
const INCREMENTS: [u32; 3] = [1, 2, 3];

impl Workload {
    fn run(&self, vm: &Arc<VirtualMemory>, path: &str) -> Result<Report, VmError> {
        let parent = vm.create_process(path)?;
        let shm = vm.allocate_shared_memory(parent, 3 * 4)?;
        for (i, value) in INITIAL_FIELDS.iter().enumerate() {
            vm.write_u32(parent, field(shm, i), *value)?;
        }
        let private_pages = shm.floor().0;
        // updates of the shared fields are not atomic, children take turns
        let turn = Arc::new(Mutex::new(()));
        let mut handles = Vec::new();
        for i in 0..self.children {
            let child = vm.duplicate_address_space(parent)?;
            let vm = Arc::clone(vm);
            let turn = Arc::clone(&turn);
            let mut rng = StdRng::seed_from_u64(self.seed + i as u64);
            let touches = self.touches;
            handles.push(thread::spawn(move || -> Result<(), VmError> {
                for _ in 0..touches {
                    let addr = VirtAddr(rng.gen_range(0..private_pages * PAGE_SIZE) & !3);
                    if rng.gen_bool(0.5) {
                        vm.write_u32(child, addr, rng.gen())?;
                    } else {
                        vm.read_u32(child, addr)?;
                    }
                }
                {
                    let _turn = turn.lock().unwrap();
                    for (i, inc) in INCREMENTS.iter().enumerate() {
                        let value = vm.read_u32(child, field(shm, i))?;
                        vm.write_u32(child, field(shm, i), value + inc)?;
                    }
                }
                debug!("{:?} done", child);
                vm.on_process_exit(child)
            }));
        }
        for handle in handles {
            handle.join().unwrap()?;
        }
        let first = vm.read_u32(parent, field(shm, 0))?;
        vm.write_u32(parent, field(shm, 0), first + 1)?;
        let mut fields = [0u32; 3];
        for (i, value) in fields.iter_mut().enumerate() {
            *value = vm.read_u32(parent, field(shm, i))?;
        }
        let stats = vm.stats();
        vm.on_process_exit(parent)?;
        Ok(Report { fields, stats })
    }
}

fn field(shm: VirtAddr, index: usize) -> VirtAddr {
    VirtAddr(shm.0 + index * 4)
}

#[test]
fn shmtest_workload() {
    let loader = MemoryLoader::new();
    loader.insert("shmtest", build_image(&[0u8; 2 * PAGE_SIZE], &[7u8; 16], 0));
    let vm = Arc::new(VirtualMemory::new(
        Arc::new(loader),
        VmConfig::new(16, ReplacementPolicy::Fifo),
    ));
    let workload = Workload {
        children: 10,
        touches: 50,
        seed: 7,
    };
    let report = workload.run(&vm, "shmtest").unwrap();
    pretty_assertions::assert_eq!(report.fields, [1011, 100020, 31]);
    assert!(report.stats.evictions > 0);
    assert_eq!(report.stats.pinned_frames, 1);
    assert!(vm.pids().is_empty());
    assert_eq!(vm.stats().resident_frames, 0);
}

#[test]
fn packed_image_round_trips_through_the_host_loader() {
    let dir = std::env::temp_dir().join(format!("easy-vm-sim-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("prog"), build_image(&[9u8; 10], &[4, 5], 32)).unwrap();
    let vm = VirtualMemory::new(
        Arc::new(HostLoader { root: dir.clone() }),
        VmConfig::default(),
    );
    assert_eq!(vm.create_process("missing"), Err(VmError::NotFound));
    let pid = vm.create_process("prog").unwrap();
    let mut buf = [0u8; 14];
    vm.read_mem(pid, VirtAddr(0), &mut buf).unwrap();
    assert_eq!(buf, [9, 9, 9, 9, 9, 9, 9, 9, 9, 9, 4, 5, 0, 0]);
    fs::remove_dir_all(&dir).unwrap();
}
