//! PuTTY's Pageant channel.
//!
//! Clients find a hidden window titled `Pageant` and send it `WM_COPYDATA`
//! naming a file mapping that holds one framed agent request.  The window
//! procedure runs on a dedicated message-loop thread; each request is handed
//! to the accept loop as a [`PageantStream`] and the reply written by the
//! session is copied back into the mapping once the stream is dropped.
//!
//! A mapping is only served when it belongs to the user running the daemon,
//! and is never read or written past the size of its mapped region.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::oneshot;

use crate::{Bound, Transport, TransportError, TransportKind};

/// Size every Pageant client has allocated since the protocol began.
pub const LEGACY_MAPPING_LEN: usize = 8192;

/// Upper bound on how much of a mapping is used.  PuTTY 0.75 and later
/// allocate 256 KiB.
pub const MAX_MAPPING_LEN: usize = 256 * 1024;

/// `dwData` tag of a Pageant `WM_COPYDATA` message.
pub const COPYDATA_ID: usize = 0x804e_50ba;

/// One request received through the window, waiting for its reply.
#[derive(Debug)]
pub(crate) struct PageantRequest {
    frame: Vec<u8>,
    /// Room for the reply in the client's mapping.
    capacity: usize,
    reply: oneshot::Sender<Vec<u8>>,
}

impl PageantRequest {
    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn new(frame: Vec<u8>, capacity: usize) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                frame,
                capacity,
                reply,
            },
            rx,
        )
    }
}

/// In-memory duplex stream over a single request: reads yield the request
/// frame, writes collect the reply, and dropping it delivers the reply.
#[derive(Debug)]
pub struct PageantStream {
    request: Vec<u8>,
    pos: usize,
    response: Vec<u8>,
    capacity: usize,
    reply: Option<oneshot::Sender<Vec<u8>>>,
}

impl PageantStream {
    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn new(request: PageantRequest) -> Self {
        Self {
            request: request.frame,
            pos: 0,
            response: Vec::new(),
            capacity: request.capacity,
            reply: Some(request.reply),
        }
    }
}

impl AsyncRead for PageantStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let remaining = &this.request[this.pos..];
        let n = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for PageantStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.response.len() + buf.len() > self.capacity {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "pageant reply too large",
            )));
        }
        self.response.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl Drop for PageantStream {
    fn drop(&mut self) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(std::mem::take(&mut self.response));
        }
    }
}

/// Validate the contents of a client's file mapping and return the request
/// frame it carries.  `mapping` must span exactly the accessible bytes; a
/// length prefix claiming more than that is rejected.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn request_frame(mapping: &[u8]) -> Option<Vec<u8>> {
    let header: [u8; 4] = mapping.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len + 4 > MAX_MAPPING_LEN {
        return None;
    }
    mapping.get(..len + 4).map(<[u8]>::to_vec)
}

#[derive(Debug, Clone, Default)]
pub struct PageantTransport;

impl PageantTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Transport for PageantTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Pageant
    }

    async fn bind(&self) -> Result<Bound, TransportError> {
        Ok(Bound {
            acceptor: bind_window().await?,
            help: "PuTTY and other Pageant clients can use this agent".to_string(),
        })
    }
}

#[cfg(windows)]
async fn bind_window() -> Result<Box<dyn crate::Acceptor>, TransportError> {
    let acceptor = imp::WindowAcceptor::spawn()
        .await
        .map_err(|source| TransportError::Bind {
            transport: TransportKind::Pageant,
            source,
        })?;
    Ok(Box::new(acceptor))
}

#[cfg(not(windows))]
async fn bind_window() -> Result<Box<dyn crate::Acceptor>, TransportError> {
    Err(TransportError::Unsupported(TransportKind::Pageant))
}

#[cfg(windows)]
mod imp {
    use std::cell::RefCell;
    use std::ffi::CStr;
    use std::io;
    use std::ptr::null_mut;

    use tokio::sync::{mpsc, oneshot};
    use tracing::{debug, warn};
    use windows_sys::Win32::Foundation::{
        CloseHandle, ERROR_SUCCESS, HANDLE, HLOCAL, HWND, LPARAM, LRESULT, LocalFree, WPARAM,
    };
    use windows_sys::Win32::Security::Authorization::{GetSecurityInfo, SE_KERNEL_OBJECT};
    use windows_sys::Win32::Security::{
        EqualSid, GetTokenInformation, OWNER_SECURITY_INFORMATION, PSECURITY_DESCRIPTOR, PSID,
        TOKEN_QUERY, TOKEN_USER, TokenUser,
    };
    use windows_sys::Win32::System::DataExchange::COPYDATASTRUCT;
    use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows_sys::Win32::System::Memory::{
        FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS, MapViewOfFile,
        OpenFileMappingA, UnmapViewOfFile, VirtualQuery,
    };
    use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
    use windows_sys::Win32::UI::WindowsAndMessaging::{
        CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, FindWindowW,
        GetMessageW, MSG, PostMessageW, PostQuitMessage, RegisterClassW, TranslateMessage,
        WM_CLOSE, WM_COPYDATA, WM_DESTROY, WNDCLASSW,
    };

    use super::{COPYDATA_ID, MAX_MAPPING_LEN, PageantRequest, PageantStream, request_frame};
    use crate::{AcceptStrategy, Accepted, Acceptor};

    thread_local! {
        static REQUESTS: RefCell<Option<mpsc::UnboundedSender<PageantRequest>>> =
            const { RefCell::new(None) };
    }

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub(super) struct WindowAcceptor {
        requests: mpsc::UnboundedReceiver<PageantRequest>,
        // HWND is a raw pointer; kept as an integer so the acceptor is Send.
        hwnd: isize,
    }

    impl WindowAcceptor {
        pub(super) async fn spawn() -> io::Result<Self> {
            let (tx, requests) = mpsc::unbounded_channel();
            let (ready_tx, ready_rx) = oneshot::channel();

            std::thread::Builder::new()
                .name("pageant-window".into())
                .spawn(move || message_loop(tx, ready_tx))?;

            let hwnd = ready_rx
                .await
                .map_err(|_| io::Error::other("pageant window thread exited"))??;
            debug!("pageant window created");
            Ok(Self { requests, hwnd })
        }
    }

    impl Drop for WindowAcceptor {
        fn drop(&mut self) {
            // SAFETY: posting to a window that is already gone is harmless.
            unsafe {
                PostMessageW(self.hwnd as HWND, WM_CLOSE, 0, 0);
            }
        }
    }

    #[async_trait::async_trait]
    impl Acceptor for WindowAcceptor {
        fn strategy(&self) -> AcceptStrategy {
            AcceptStrategy::InterruptOnClose
        }

        async fn accept(&mut self) -> io::Result<Accepted> {
            Ok(match self.requests.recv().await {
                Some(request) => Accepted::Connection(Box::new(PageantStream::new(request))),
                None => Accepted::Closed,
            })
        }
    }

    fn message_loop(
        tx: mpsc::UnboundedSender<PageantRequest>,
        ready: oneshot::Sender<io::Result<isize>>,
    ) {
        let hwnd = match create_window() {
            Ok(hwnd) => hwnd,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        REQUESTS.with(|slot| *slot.borrow_mut() = Some(tx));
        let _ = ready.send(Ok(hwnd as isize));

        // SAFETY: standard Win32 message pump on the thread owning the window.
        unsafe {
            let mut msg: MSG = std::mem::zeroed();
            while GetMessageW(&mut msg, std::ptr::null_mut(), 0, 0) > 0 {
                TranslateMessage(&msg);
                DispatchMessageW(&msg);
            }
        }
        REQUESTS.with(|slot| slot.borrow_mut().take());
        debug!("pageant message loop finished");
    }

    fn create_window() -> io::Result<HWND> {
        let name = wide("Pageant");
        // SAFETY: all pointers refer to live, NUL-terminated buffers.
        unsafe {
            if !FindWindowW(name.as_ptr(), name.as_ptr()).is_null() {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "another Pageant is already running",
                ));
            }
            let instance = GetModuleHandleW(std::ptr::null());
            let mut class: WNDCLASSW = std::mem::zeroed();
            class.lpfnWndProc = Some(window_proc);
            class.hInstance = instance;
            class.lpszClassName = name.as_ptr();
            if RegisterClassW(&class) == 0 {
                return Err(io::Error::last_os_error());
            }
            let hwnd = CreateWindowExW(
                0,
                name.as_ptr(),
                name.as_ptr(),
                0,
                0,
                0,
                0,
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                instance,
                std::ptr::null(),
            );
            if hwnd.is_null() {
                return Err(io::Error::last_os_error());
            }
            Ok(hwnd)
        }
    }

    unsafe extern "system" fn window_proc(
        hwnd: HWND,
        msg: u32,
        wparam: WPARAM,
        lparam: LPARAM,
    ) -> LRESULT {
        match msg {
            WM_COPYDATA => {
                // SAFETY: for WM_COPYDATA lparam points at a COPYDATASTRUCT
                // valid for the duration of the call.
                let data = unsafe { &*(lparam as *const COPYDATASTRUCT) };
                if data.dwData != COPYDATA_ID || data.lpData.is_null() {
                    return 0;
                }
                // SAFETY: lpData holds the NUL-terminated mapping name.
                let name = unsafe { CStr::from_ptr(data.lpData as *const _) };
                match serve_mapping(name) {
                    Ok(()) => 1,
                    Err(e) => {
                        warn!(error = %e, "pageant request failed");
                        0
                    }
                }
            }
            WM_CLOSE => {
                // SAFETY: hwnd is the window this procedure belongs to.
                unsafe { DestroyWindow(hwnd) };
                0
            }
            WM_DESTROY => {
                REQUESTS.with(|slot| slot.borrow_mut().take());
                // SAFETY: ends the message loop of the current thread.
                unsafe { PostQuitMessage(0) };
                0
            }
            // SAFETY: default handling for everything else.
            _ => unsafe { DefWindowProcW(hwnd, msg, wparam, lparam) },
        }
    }

    /// Open the client's mapping, run the request through the accept loop
    /// and copy the reply back.  Blocks the message loop while the session
    /// answers, as Pageant clients expect a synchronous reply.
    fn serve_mapping(name: &CStr) -> io::Result<()> {
        // SAFETY: the handle is checked for null and closed exactly once.
        unsafe {
            let handle = OpenFileMappingA(FILE_MAP_ALL_ACCESS, 0, name.as_ptr().cast());
            if handle.is_null() {
                return Err(io::Error::last_os_error());
            }
            let result = serve_handle(handle);
            CloseHandle(handle);
            result
        }
    }

    fn serve_handle(handle: HANDLE) -> io::Result<()> {
        if !owned_by_current_user(handle)? {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "mapping belongs to another user",
            ));
        }

        // SAFETY: the slice covers at most the region VirtualQuery reports
        // for the view, and the view stays mapped until after `exchange`.
        unsafe {
            let view = MapViewOfFile(handle, FILE_MAP_ALL_ACCESS, 0, 0, 0);
            if view.Value.is_null() {
                return Err(io::Error::last_os_error());
            }
            let mut info: MEMORY_BASIC_INFORMATION = std::mem::zeroed();
            let queried = VirtualQuery(
                view.Value,
                &mut info,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            );
            let outcome = if queried == 0 {
                Err(io::Error::last_os_error())
            } else {
                let len = info.RegionSize.min(MAX_MAPPING_LEN);
                exchange(std::slice::from_raw_parts_mut(view.Value.cast::<u8>(), len))
            };
            UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS { Value: view.Value });
            outcome
        }
    }

    /// `TOKEN_USER` of this process, in a buffer aligned for it.
    struct CurrentUser(Vec<u64>);

    impl CurrentUser {
        fn query() -> io::Result<Self> {
            // SAFETY: the token handle is closed before returning and the
            // buffer is sized by the first GetTokenInformation call.
            unsafe {
                let mut token: HANDLE = null_mut();
                if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
                    return Err(io::Error::last_os_error());
                }
                let mut len = 0u32;
                GetTokenInformation(token, TokenUser, null_mut(), 0, &mut len);
                let mut buf = vec![0u64; (len as usize).div_ceil(8).max(1)];
                let ok = GetTokenInformation(token, TokenUser, buf.as_mut_ptr().cast(), len, &mut len);
                let err = io::Error::last_os_error();
                CloseHandle(token);
                if ok == 0 {
                    return Err(err);
                }
                Ok(Self(buf))
            }
        }

        fn sid(&self) -> PSID {
            // SAFETY: the buffer was filled with a TOKEN_USER.
            unsafe { (*self.0.as_ptr().cast::<TOKEN_USER>()).User.Sid }
        }
    }

    fn owned_by_current_user(handle: HANDLE) -> io::Result<bool> {
        let user = CurrentUser::query()?;
        // SAFETY: the descriptor returned by GetSecurityInfo owns `owner` and
        // is released with LocalFree after the comparison.
        unsafe {
            let mut owner: PSID = null_mut();
            let mut descriptor: PSECURITY_DESCRIPTOR = null_mut();
            let status = GetSecurityInfo(
                handle,
                SE_KERNEL_OBJECT,
                OWNER_SECURITY_INFORMATION,
                &mut owner,
                null_mut(),
                null_mut(),
                null_mut(),
                &mut descriptor,
            );
            if status != ERROR_SUCCESS {
                return Err(io::Error::from_raw_os_error(status as i32));
            }
            let same = !owner.is_null() && EqualSid(owner, user.sid()) != 0;
            LocalFree(descriptor as HLOCAL);
            Ok(same)
        }
    }

    fn exchange(mapping: &mut [u8]) -> io::Result<()> {
        let frame = request_frame(mapping)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad pageant request"))?;
        let (request, reply) = PageantRequest::new(frame, mapping.len());

        let sent = REQUESTS.with(|slot| {
            slot.borrow()
                .as_ref()
                .is_some_and(|tx| tx.send(request).is_ok())
        });
        if !sent {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }

        let response = reply
            .blocking_recv()
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        if response.is_empty() || response.len() > mapping.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "no usable reply"));
        }
        mapping[..response.len()].copy_from_slice(&response);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    #[test]
    fn request_frame_checks_length_prefix() {
        let mut mapping = vec![0u8; LEGACY_MAPPING_LEN];
        mapping[..4].copy_from_slice(&1u32.to_be_bytes());
        mapping[4] = 11;
        assert_eq!(request_frame(&mapping).unwrap(), vec![0, 0, 0, 1, 11]);

        mapping[..4].copy_from_slice(&0u32.to_be_bytes());
        assert!(request_frame(&mapping).is_none());

        mapping[..4].copy_from_slice(&(LEGACY_MAPPING_LEN as u32).to_be_bytes());
        assert!(request_frame(&mapping).is_none());

        assert!(request_frame(&[0, 0]).is_none());
    }

    #[test]
    fn request_frame_stays_inside_the_mapping() {
        // One page mapped, but the prefix claims a legacy-sized request.
        let mut page = vec![0u8; 4096];
        page[..4].copy_from_slice(&8000u32.to_be_bytes());
        assert!(request_frame(&page).is_none());

        page[..4].copy_from_slice(&4092u32.to_be_bytes());
        assert_eq!(request_frame(&page).unwrap().len(), 4096);
    }

    #[test]
    fn large_mappings_carry_large_requests() {
        let mut mapping = vec![0u8; MAX_MAPPING_LEN];
        let len = (MAX_MAPPING_LEN - 4) as u32;
        mapping[..4].copy_from_slice(&len.to_be_bytes());
        assert_eq!(request_frame(&mapping).unwrap().len(), MAX_MAPPING_LEN);

        let mut oversized = vec![0u8; MAX_MAPPING_LEN + 8];
        oversized[..4].copy_from_slice(&(len + 4).to_be_bytes());
        assert!(request_frame(&oversized).is_none());
    }

    #[tokio::test]
    async fn stream_reads_request_then_eof_and_delivers_reply_on_drop() {
        let (request, reply) = PageantRequest::new(vec![0, 0, 0, 1, 11], LEGACY_MAPPING_LEN);
        let mut stream = PageantStream::new(request);

        let mut frame = Vec::new();
        stream.read_to_end(&mut frame).await.unwrap();
        assert_eq!(frame, vec![0, 0, 0, 1, 11]);

        stream.write_all(&[0, 0, 0, 5, 12, 0, 0, 0, 0]).await.unwrap();
        stream.flush().await.unwrap();
        drop(stream);

        assert_eq!(reply.await.unwrap(), vec![0, 0, 0, 5, 12, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn reply_larger_than_the_mapping_is_rejected() {
        let (request, reply) = PageantRequest::new(vec![0, 0, 0, 1, 11], 4096);
        let mut stream = PageantStream::new(request);
        let big = vec![0u8; 4097];
        assert!(stream.write_all(&big).await.is_err());
        drop(stream);
        assert!(reply.await.unwrap().is_empty());

        let (request, reply) = PageantRequest::new(vec![0, 0, 0, 1, 11], MAX_MAPPING_LEN);
        let mut stream = PageantStream::new(request);
        stream.write_all(&vec![1u8; 64 * 1024]).await.unwrap();
        drop(stream);
        assert_eq!(reply.await.unwrap().len(), 64 * 1024);
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn unsupported_off_windows() {
        assert!(matches!(
            PageantTransport::new().bind().await,
            Err(TransportError::Unsupported(TransportKind::Pageant))
        ));
    }
}
