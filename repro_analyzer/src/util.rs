use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use repro_core::prog::Prog;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};

/// URL-safe base64 of sha256 over `data`.
pub fn hash_bytes(data: &[u8]) -> String {
    URL_SAFE.encode(Sha256::digest(data))
}

/// Content-addressed id of a program, stable across runs.
pub fn prog_hash(prog: &Prog) -> String {
    hash_bytes(&prog.serialize())
}

/// Internal key of a (pool, vm) slot. The rpc wire carries the pair as
/// separate fields; the pairing caps vm ids below 1000.
pub type VmKey = u64;

pub fn vm_key(pool: usize, vm: usize) -> VmKey {
    (pool * 1000 + vm) as VmKey
}

static STOP_SOON: AtomicBool = AtomicBool::new(false);

pub fn stop_soon() -> bool {
    STOP_SOON.load(Ordering::Acquire)
}

pub fn stop_req() {
    STOP_SOON.store(true, Ordering::Release)
}

pub fn stop_flag() -> &'static AtomicBool {
    &STOP_SOON
}
