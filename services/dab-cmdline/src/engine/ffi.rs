//! Runtime binding to the DAB decoding library
//!
//! The library is opened with `libloading` and exports a flat C interface:
//!
//! - `dabInit(source, callbacks, spectrum, constellation, ctx) -> handle`
//! - `dabStartProcessing`, `dabStop`, `dabExit`, `dabReset_msc` (handle)
//! - `set_audioChannel(handle, audiodata)`
//! - `dab_getserviceName(handle, sid, buffer, size) -> bool`
//! - `is_audioService(handle, name) -> bool`
//! - `dataforAudioService(handle, name, audiodata, component)`
//!
//! Events come back through the [`Callbacks`] table; every trampoline
//! forwards to the [`EventSink`] held in the shared [`Context`].

use std::borrow::Cow;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::ptr;
use std::slice;
use std::sync::Arc;

use libloading::Library;
use num_complex::Complex32;
use tracing::{debug, error, info};

use super::{AudioData, DabEngine, DlPlusTag, EngineError, EventSink, TiiData};
use crate::device::DeviceHandler;

type Ctx = *mut c_void;
type Handle = *mut c_void;

/// Size of the buffer handed to `dab_getserviceName`
const SERVICE_NAME_LEN: usize = 256;

/// Engine parameters fixed at initialisation
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// DAB transmission mode (1, 2 or 4)
    pub mode: u8,
    pub threshold: i16,
}

#[repr(C)]
#[derive(Default)]
struct RawAudioData {
    defined: bool,
    sub_ch_id: i16,
    start_addr: i16,
    short_form: bool,
    prot_level: i16,
    length: i16,
    bit_rate: i16,
    asc_ty: i16,
    language: i16,
    program_type: i16,
}

impl From<&RawAudioData> for AudioData {
    fn from(raw: &RawAudioData) -> Self {
        AudioData {
            defined: raw.defined,
            sub_ch_id: raw.sub_ch_id,
            start_addr: raw.start_addr,
            short_form: raw.short_form,
            prot_level: raw.prot_level,
            length: raw.length,
            bit_rate: raw.bit_rate,
            asc_ty: raw.asc_ty,
            language: raw.language,
            program_type: raw.program_type,
        }
    }
}

impl From<&AudioData> for RawAudioData {
    fn from(data: &AudioData) -> Self {
        RawAudioData {
            defined: data.defined,
            sub_ch_id: data.sub_ch_id,
            start_addr: data.start_addr,
            short_form: data.short_form,
            prot_level: data.prot_level,
            length: data.length,
            bit_rate: data.bit_rate,
            asc_ty: data.asc_ty,
            language: data.language,
            program_type: data.program_type,
        }
    }
}

#[repr(C)]
struct RawDlPlusTag {
    content_type: u8,
    start_marker: u8,
    length: u8,
}

#[repr(C)]
struct RawTii {
    main_id: u8,
    sub_id: u8,
}

type SyncFn = extern "C" fn(bool, Ctx);
type SystemDataFn = extern "C" fn(bool, i16, i32, Ctx);
type EnsembleFn = extern "C" fn(*const c_char, c_int, Ctx);
type ServiceNameFn = extern "C" fn(*const c_char, c_int, u16, Ctx);
type FibQualityFn = extern "C" fn(i16, Ctx);
type AudioOutFn = extern "C" fn(*const i16, c_int, c_int, bool, Ctx);
type DataOutFn = extern "C" fn(*const c_char, Ctx);
type DlPlusFn = extern "C" fn(*const c_char, u8, *const RawDlPlusTag, bool, bool, Ctx);
type BytesOutFn = extern "C" fn(*const u8, i16, u8, Ctx);
type ProgramDataFn = extern "C" fn(*const RawAudioData, Ctx);
type ProgramQualityFn = extern "C" fn(i16, i16, i16, Ctx);
type MotDataFn = extern "C" fn(*const u8, c_int, *const c_char, c_int, Ctx);
type TiiFn = extern "C" fn(*const RawTii, Ctx);
type TimeFn = extern "C" fn(c_int, c_int, Ctx);

/// Parameters and event handlers passed to `dabInit`
#[repr(C)]
struct Callbacks {
    dab_mode: u8,
    threshold_value: i16,
    syncsignal: Option<SyncFn>,
    systemdata: Option<SystemDataFn>,
    name_of_ensemble: Option<EnsembleFn>,
    service_name: Option<ServiceNameFn>,
    fib_quality: Option<FibQualityFn>,
    audio_out: Option<AudioOutFn>,
    data_out: Option<DataOutFn>,
    dl_plus_out: Option<DlPlusFn>,
    bytes_out: Option<BytesOutFn>,
    programdata: Option<ProgramDataFn>,
    program_quality: Option<ProgramQualityFn>,
    motdata: Option<MotDataFn>,
    tii_data: Option<TiiFn>,
    time: Option<TimeFn>,
}

/// Sample provider the engine pulls from
#[repr(C)]
struct SampleSource {
    ctx: Ctx,
    get_samples: extern "C" fn(*mut Complex32, i32, Ctx) -> i32,
    samples: extern "C" fn(Ctx) -> i32,
}

/// Shared state behind every `ctx` pointer handed to the library
struct Context {
    sink: Arc<dyn EventSink>,
    device: Arc<dyn DeviceHandler>,
}

type InitFn = unsafe extern "C" fn(*mut SampleSource, *mut Callbacks, Ctx, Ctx, Ctx) -> Handle;
type HandleFn = unsafe extern "C" fn(Handle);
type SetChannelFn = unsafe extern "C" fn(Handle, *const RawAudioData);
type GetServiceNameFn = unsafe extern "C" fn(Handle, u32, *mut c_char, c_int) -> bool;
type IsAudioFn = unsafe extern "C" fn(Handle, *const c_char) -> bool;
type AudioDataFn = unsafe extern "C" fn(Handle, *const c_char, *mut RawAudioData, c_int);

struct Api {
    init: InitFn,
    start_processing: HandleFn,
    stop: HandleFn,
    exit: HandleFn,
    reset_msc: HandleFn,
    set_audio_channel: SetChannelFn,
    get_service_name: GetServiceNameFn,
    is_audio_service: IsAudioFn,
    data_for_audio_service: AudioDataFn,
}

fn symbol<T: Copy>(lib: &Library, name: &'static str) -> Result<T, EngineError> {
    // SAFETY: the caller names the exported symbol with its declared type;
    // the copied function pointer stays valid while `lib` is loaded
    unsafe { lib.get::<T>(name.as_bytes()) }
        .map(|s| *s)
        .map_err(|_| EngineError::MissingSymbol(name))
}

impl Api {
    fn resolve(lib: &Library) -> Result<Self, EngineError> {
        Ok(Api {
            init: symbol(lib, "dabInit")?,
            start_processing: symbol(lib, "dabStartProcessing")?,
            stop: symbol(lib, "dabStop")?,
            exit: symbol(lib, "dabExit")?,
            reset_msc: symbol(lib, "dabReset_msc")?,
            set_audio_channel: symbol(lib, "set_audioChannel")?,
            get_service_name: symbol(lib, "dab_getserviceName")?,
            is_audio_service: symbol(lib, "is_audioService")?,
            data_for_audio_service: symbol(lib, "dataforAudioService")?,
        })
    }
}

/// The decoding library, initialised and ready to process
pub struct LibDab {
    api: Api,
    handle: Handle,
    exited: bool,
    context: *mut Context,
    // the engine keeps pointers to both tables until dabExit
    _callbacks: Box<Callbacks>,
    _source: Box<SampleSource>,
    _lib: Library,
}

impl LibDab {
    pub fn open(
        path: &Path,
        options: EngineOptions,
        device: Arc<dyn DeviceHandler>,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, EngineError> {
        // SAFETY: loading runs the library's initialisers; the engine
        // library has no unusual load-time requirements
        let lib = unsafe { Library::new(path) }.map_err(|e| EngineError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let api = Api::resolve(&lib)?;

        let info = sink.wants_info();
        let context = Box::into_raw(Box::new(Context { sink, device }));
        let mut callbacks = Box::new(Callbacks {
            dab_mode: options.mode,
            threshold_value: options.threshold,
            syncsignal: Some(on_sync_signal),
            systemdata: Some(on_system_data),
            name_of_ensemble: Some(on_ensemble_name),
            service_name: Some(on_service_name),
            fib_quality: Some(on_fib_quality),
            audio_out: Some(on_audio_out),
            data_out: info.then_some(on_dynamic_label as DataOutFn),
            dl_plus_out: info.then_some(on_dl_plus as DlPlusFn),
            bytes_out: Some(on_bytes_out),
            programdata: Some(on_program_data),
            program_quality: Some(on_program_quality),
            motdata: info.then_some(on_mot_data as MotDataFn),
            tii_data: Some(on_tii_data),
            time: Some(on_time),
        });
        let mut source = Box::new(SampleSource {
            ctx: context.cast(),
            get_samples: pull_samples,
            samples: available_samples,
        });

        // SAFETY: both tables and the context outlive the handle; they are
        // released only after dabExit in Drop
        let handle = unsafe {
            (api.init)(
                &mut *source,
                &mut *callbacks,
                ptr::null_mut(),
                ptr::null_mut(),
                context.cast(),
            )
        };
        if handle.is_null() {
            // SAFETY: the library rejected the context and holds no copy
            drop(unsafe { Box::from_raw(context) });
            return Err(EngineError::InitFailed);
        }

        info!("Decoding engine loaded from {}", path.display());
        Ok(LibDab {
            api,
            handle,
            exited: false,
            context,
            _callbacks: callbacks,
            _source: source,
            _lib: lib,
        })
    }

    fn live(&self) -> Option<Handle> {
        (!self.exited).then_some(self.handle)
    }
}

impl DabEngine for LibDab {
    fn start_processing(&mut self) {
        if let Some(handle) = self.live() {
            // SAFETY: handle comes from dabInit and dabExit has not run
            unsafe { (self.api.start_processing)(handle) }
        }
    }

    fn stop(&mut self) {
        if let Some(handle) = self.live() {
            // SAFETY: as above
            unsafe { (self.api.stop)(handle) }
        }
    }

    fn exit(&mut self) {
        if let Some(handle) = self.live() {
            debug!("Releasing decoding engine");
            // SAFETY: as above; the handle is not used afterwards
            unsafe { (self.api.exit)(handle) }
            self.exited = true;
        }
    }

    fn reset_msc(&mut self) {
        if let Some(handle) = self.live() {
            // SAFETY: as above
            unsafe { (self.api.reset_msc)(handle) }
        }
    }

    fn set_audio_channel(&mut self, data: &AudioData) {
        if let Some(handle) = self.live() {
            let raw = RawAudioData::from(data);
            // SAFETY: `raw` lives across the call
            unsafe { (self.api.set_audio_channel)(handle, &raw) }
        }
    }

    fn service_name(&self, sid: u32) -> Option<String> {
        let handle = self.live()?;
        let mut buffer = [0 as c_char; SERVICE_NAME_LEN];
        // SAFETY: the library writes at most `SERVICE_NAME_LEN` bytes
        let found = unsafe {
            (self.api.get_service_name)(handle, sid, buffer.as_mut_ptr(), SERVICE_NAME_LEN as c_int)
        };
        buffer[SERVICE_NAME_LEN - 1] = 0;
        if !found || buffer[0] == 0 {
            return None;
        }
        // SAFETY: the buffer is NUL terminated above
        let name = unsafe { CStr::from_ptr(buffer.as_ptr()) };
        Some(name.to_string_lossy().trim_end().to_string())
    }

    fn is_audio_service(&self, name: &str) -> bool {
        let (Some(handle), Ok(name)) = (self.live(), CString::new(name)) else {
            return false;
        };
        // SAFETY: `name` is a valid C string for the duration of the call
        unsafe { (self.api.is_audio_service)(handle, name.as_ptr()) }
    }

    fn data_for_audio_service(&self, name: &str) -> AudioData {
        let (Some(handle), Ok(name)) = (self.live(), CString::new(name)) else {
            return AudioData::default();
        };
        let mut raw = RawAudioData::default();
        // SAFETY: `name` and `raw` live across the call
        unsafe { (self.api.data_for_audio_service)(handle, name.as_ptr(), &mut raw, 0) };
        AudioData::from(&raw)
    }
}

impl Drop for LibDab {
    fn drop(&mut self) {
        self.exit();
        // SAFETY: after dabExit no callback can reach the context
        drop(unsafe { Box::from_raw(self.context) });
    }
}

/// Run `f` against the context behind `ctx`, containing any panic so it
/// never unwinds into the library
fn with_context<R>(ctx: Ctx, f: impl FnOnce(&Context) -> R) -> Option<R> {
    if ctx.is_null() {
        return None;
    }
    // SAFETY: every ctx handed to the library points at a live Context
    let context = unsafe { &*(ctx as *const Context) };
    match panic::catch_unwind(AssertUnwindSafe(|| f(context))) {
        Ok(r) => Some(r),
        Err(_) => {
            error!("Event handler panicked, event dropped");
            None
        }
    }
}

/// # Safety
/// `p` must be null or a NUL terminated string valid for `'a`
unsafe fn text<'a>(p: *const c_char) -> Option<Cow<'a, str>> {
    if p.is_null() {
        None
    } else {
        Some(CStr::from_ptr(p).to_string_lossy())
    }
}

/// # Safety
/// As for [`text`]
unsafe fn bytes<'a>(p: *const c_char) -> Option<&'a [u8]> {
    if p.is_null() {
        None
    } else {
        Some(CStr::from_ptr(p).to_bytes())
    }
}

/// # Safety
/// `p` must be null or valid for `len` reads during `'a`
unsafe fn view<'a, T>(p: *const T, len: c_int) -> &'a [T] {
    if p.is_null() || len <= 0 {
        &[]
    } else {
        slice::from_raw_parts(p, len as usize)
    }
}

extern "C" fn on_sync_signal(synced: bool, ctx: Ctx) {
    with_context(ctx, |c| c.sink.sync_signal(synced));
}

extern "C" fn on_system_data(synced: bool, snr: i16, freq_offset: i32, ctx: Ctx) {
    with_context(ctx, |c| c.sink.system_data(synced, snr, freq_offset));
}

extern "C" fn on_ensemble_name(name: *const c_char, id: c_int, ctx: Ctx) {
    // SAFETY: the library passes a C string valid for the call
    let name = unsafe { text(name) }.unwrap_or_default();
    with_context(ctx, |c| c.sink.ensemble_name(&name, id as u32));
}

extern "C" fn on_service_name(name: *const c_char, sid: c_int, sub_ch_id: u16, ctx: Ctx) {
    // SAFETY: as above
    let name = unsafe { text(name) }.unwrap_or_default();
    with_context(ctx, |c| c.sink.service_name(&name, sid as u32, sub_ch_id));
}

extern "C" fn on_fib_quality(quality: i16, ctx: Ctx) {
    with_context(ctx, |c| c.sink.fib_quality(quality));
}

extern "C" fn on_audio_out(buffer: *const i16, size: c_int, rate: c_int, stereo: bool, ctx: Ctx) {
    // SAFETY: `size` samples are readable for the duration of the call
    let samples = unsafe { view(buffer, size) };
    with_context(ctx, |c| c.sink.audio_out(samples, rate.max(0) as u32, stereo));
}

extern "C" fn on_dynamic_label(label: *const c_char, ctx: Ctx) {
    // SAFETY: as above
    if let Some(label) = unsafe { text(label) } {
        with_context(ctx, |c| c.sink.dynamic_label(&label));
    }
}

extern "C" fn on_dl_plus(
    label: *const c_char,
    num_tags: u8,
    tags: *const RawDlPlusTag,
    item_toggle: bool,
    item_running: bool,
    ctx: Ctx,
) {
    // SAFETY: as above; `tags` holds `num_tags` entries
    let (label, raw) = unsafe { (bytes(label), view(tags, num_tags as c_int)) };
    let Some(label) = label else { return };
    let tags: Vec<DlPlusTag> = raw
        .iter()
        .map(|t| DlPlusTag {
            content_type: t.content_type,
            start_marker: t.start_marker,
            length: t.length,
        })
        .collect();
    with_context(ctx, |c| c.sink.dl_plus(label, &tags, item_toggle, item_running));
}

extern "C" fn on_bytes_out(data: *const u8, amount: i16, frame_type: u8, ctx: Ctx) {
    // SAFETY: `amount` bytes are readable for the duration of the call
    let data = unsafe { view(data, amount as c_int) };
    with_context(ctx, |c| c.sink.bytes_out(data, frame_type));
}

extern "C" fn on_program_data(data: *const RawAudioData, ctx: Ctx) {
    if data.is_null() {
        return;
    }
    // SAFETY: non-null and valid for the call
    let data = AudioData::from(unsafe { &*data });
    with_context(ctx, |c| c.sink.program_data(&data));
}

extern "C" fn on_program_quality(frame_errors: i16, rs_errors: i16, aac_errors: i16, ctx: Ctx) {
    with_context(ctx, |c| c.sink.program_quality(frame_errors, rs_errors, aac_errors));
}

extern "C" fn on_mot_data(data: *const u8, size: c_int, name: *const c_char, subtype: c_int, ctx: Ctx) {
    // SAFETY: as above
    let (data, name) = unsafe { (view(data, size), text(name)) };
    let name = name.filter(|n| !n.is_empty());
    with_context(ctx, |c| c.sink.mot_data(data, name.as_deref(), subtype));
}

extern "C" fn on_tii_data(data: *const RawTii, ctx: Ctx) {
    if data.is_null() {
        return;
    }
    // SAFETY: non-null and valid for the call
    let raw = unsafe { &*data };
    let tii = TiiData {
        main_id: raw.main_id,
        sub_id: raw.sub_id,
    };
    with_context(ctx, |c| c.sink.tii_data(&tii));
}

extern "C" fn on_time(hours: c_int, minutes: c_int, ctx: Ctx) {
    with_context(ctx, |c| c.sink.time(hours, minutes));
}

extern "C" fn pull_samples(buffer: *mut Complex32, count: i32, ctx: Ctx) -> i32 {
    if buffer.is_null() || count <= 0 {
        return 0;
    }
    // SAFETY: the library provides room for `count` samples
    let out = unsafe { slice::from_raw_parts_mut(buffer, count as usize) };
    with_context(ctx, |c| c.device.get_samples(out) as i32).unwrap_or(0)
}

extern "C" fn available_samples(ctx: Ctx) -> i32 {
    with_context(ctx, |c| c.device.samples().min(i32::MAX as usize) as i32).unwrap_or(0)
}
