use crate::{BackgroundIoHandle, TailBuffer};
use std::{
    io::{ErrorKind, Read},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

/// Drain `f` on a background thread, keeping at most `capacity` trailing bytes.
pub fn read_background<T>(mut f: T, capacity: usize) -> BackgroundIoHandle
where
    T: Read + Send + 'static,
{
    let buf = Arc::new(Mutex::new(TailBuffer::with_capacity(capacity)));
    let finished = Arc::new(AtomicBool::new(false));
    let buf1 = Arc::clone(&buf);
    let finished1 = Arc::clone(&finished);

    std::thread::spawn(move || {
        let mut chunk = vec![0_u8; 16 * 1024].into_boxed_slice();

        loop {
            match f.read(&mut chunk[..]) {
                Ok(0) => break,
                Ok(sz) => {
                    let mut shared_buf = buf1.lock().unwrap();
                    shared_buf.extend(&chunk[..sz]);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("background read stopped: {}", e);
                    break;
                }
            }
        }
        finished1.store(true, Ordering::Release);
    });

    BackgroundIoHandle::new(buf, finished)
}
