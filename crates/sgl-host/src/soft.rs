//! Deterministic software backend.
//!
//! Tracks GL state faithfully enough to answer queries and validate
//! arguments, keeps buffer and texture objects in memory and maintains a
//! colour buffer that `Clear` fills. Drawing is accounted for but not
//! rasterized.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use sgl_protocol::gl;
use sgl_protocol::ApiVersion;

use crate::backend::GlBackend;

const IDENTITY: [f32; 16] = [
    1.0, 0.0, 0.0, 0.0, //
    0.0, 1.0, 0.0, 0.0, //
    0.0, 0.0, 1.0, 0.0, //
    0.0, 0.0, 0.0, 1.0,
];

const MAX_TEXTURE_SIZE: i32 = 8192;

const CAPABILITIES: &[u32] = &[
    gl::BLEND,
    gl::CULL_FACE,
    gl::DEPTH_TEST,
    gl::SCISSOR_TEST,
    gl::TEXTURE_2D,
];

const BLEND_FACTORS: &[u32] = &[
    gl::ZERO,
    gl::ONE,
    gl::SRC_COLOR,
    gl::ONE_MINUS_SRC_COLOR,
    gl::SRC_ALPHA,
    gl::ONE_MINUS_SRC_ALPHA,
    gl::DST_ALPHA,
    gl::ONE_MINUS_DST_ALPHA,
    gl::DST_COLOR,
    gl::ONE_MINUS_DST_COLOR,
    gl::SRC_ALPHA_SATURATE,
];

/// Counters for work that has no visible effect on the colour buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SoftStats {
    pub clears: u64,
    pub draw_calls: u64,
    pub vertices: u64,
    pub finishes: u64,
    pub flushes: u64,
}

#[derive(Clone, Debug)]
struct SoftContext {
    error: u32,
    viewport: [i32; 4],
    scissor: [i32; 4],
    clear_color: [f32; 4],
    clear_depth: f64,
    caps: BTreeSet<u32>,
    blend: (u32, u32),
    depth_func: u32,
    color: [f32; 4],
    matrix_mode: u32,
    matrices: [[f32; 16]; 3],
    pack_alignment: i32,
    unpack_alignment: i32,
    depth_range: [f64; 2],
    line_width: f32,
    array_buffer: u32,
    element_buffer: u32,
    texture_2d: u32,
}

impl SoftContext {
    fn new(width: u32, height: u32) -> Self {
        let full = [0, 0, width as i32, height as i32];
        Self {
            error: gl::NO_ERROR,
            viewport: full,
            scissor: full,
            clear_color: [0.0; 4],
            clear_depth: 1.0,
            caps: BTreeSet::new(),
            blend: (gl::ONE, gl::ZERO),
            depth_func: gl::LESS,
            color: [1.0; 4],
            matrix_mode: gl::MODELVIEW,
            matrices: [IDENTITY; 3],
            pack_alignment: 4,
            unpack_alignment: 4,
            depth_range: [0.0, 1.0],
            line_width: 1.0,
            array_buffer: 0,
            element_buffer: 0,
            texture_2d: 0,
        }
    }
}

#[derive(Clone, Debug)]
struct SoftImage {
    width: i32,
    height: i32,
    pixels: Vec<u8>,
}

#[derive(Clone, Debug, Default)]
struct SoftTexture {
    levels: BTreeMap<i32, SoftImage>,
    params: BTreeMap<u32, i32>,
}

pub struct SoftGlBackend {
    version: ApiVersion,
    contexts: BTreeMap<u32, SoftContext>,
    current: u32,
    next_context: u32,
    width: u32,
    height: u32,
    /// RGBA8, bottom row first.
    color: Vec<u8>,
    buffers: HashMap<u32, Vec<u8>>,
    textures: HashMap<u32, SoftTexture>,
    next_name: u32,
    syncs: BTreeSet<u32>,
    next_sync: u32,
    stats: SoftStats,
}

impl SoftGlBackend {
    /// A backend with one current context and an empty drawable.
    pub fn new(version: ApiVersion) -> Self {
        let mut backend = Self {
            version,
            contexts: BTreeMap::new(),
            current: 0,
            next_context: 1,
            width: 0,
            height: 0,
            color: Vec::new(),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            next_name: 1,
            syncs: BTreeSet::new(),
            next_sync: 1,
            stats: SoftStats::default(),
        };
        backend.current = backend.create_context();
        backend
    }

    pub fn version(&self) -> ApiVersion {
        self.version
    }

    pub fn stats(&self) -> SoftStats {
        self.stats
    }

    /// RGBA of the pixel at `(x, y)`, with `y` counted from the bottom row.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let i = ((y * self.width + x) * 4) as usize;
        self.color.get(i..i + 4).and_then(|p| p.try_into().ok())
    }

    pub fn buffer_contents(&self, id: u32) -> Option<&[u8]> {
        self.buffers.get(&id).map(Vec::as_slice)
    }

    /// Dimensions and pixels of one mip level of texture `id`.
    pub fn texture_level(&self, id: u32, level: i32) -> Option<(i32, i32, &[u8])> {
        let image = self.textures.get(&id)?.levels.get(&level)?;
        Some((image.width, image.height, image.pixels.as_slice()))
    }

    fn ctx(&mut self) -> &mut SoftContext {
        let (width, height) = (self.width, self.height);
        self.contexts
            .entry(self.current)
            .or_insert_with(|| SoftContext::new(width, height))
    }

    fn set_error(&mut self, code: u32) {
        let ctx = self.ctx();
        if ctx.error == gl::NO_ERROR {
            ctx.error = code;
        }
    }

    /// Allocates `count` fresh names, or none with `OUT_OF_MEMORY` once the
    /// name space is exhausted.
    fn gen_names(&mut self, count: u32) -> Vec<u32> {
        let Some(next) = self.next_name.checked_add(count) else {
            self.set_error(gl::OUT_OF_MEMORY);
            return Vec::new();
        };
        let names = (self.next_name..next).collect();
        self.next_name = next;
        names
    }

    /// The buffer bound to `target`, recording the GL error if there is none.
    fn bound_buffer(&mut self, target: u32) -> Option<u32> {
        let id = match target {
            gl::ARRAY_BUFFER => self.ctx().array_buffer,
            gl::ELEMENT_ARRAY_BUFFER => self.ctx().element_buffer,
            _ => {
                self.set_error(gl::INVALID_ENUM);
                return None;
            }
        };
        if id == 0 {
            self.set_error(gl::INVALID_OPERATION);
            return None;
        }
        Some(id)
    }

    fn scissored_rect(&mut self) -> (u32, u32, u32, u32) {
        let (width, height) = (self.width as i64, self.height as i64);
        let ctx = self.ctx();
        if !ctx.caps.contains(&gl::SCISSOR_TEST) {
            return (0, 0, width as u32, height as u32);
        }
        let [x, y, w, h] = ctx.scissor.map(i64::from);
        let x0 = x.clamp(0, width);
        let y0 = y.clamp(0, height);
        let x1 = (x + w).clamp(0, width);
        let y1 = (y + h).clamp(0, height);
        (x0 as u32, y0 as u32, x1.max(x0) as u32, y1.max(y0) as u32)
    }
}

fn unorm8(value: f32) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

fn bytes_per_pixel(format: u32) -> Option<usize> {
    match format {
        gl::RGBA | gl::BGRA => Some(4),
        gl::RGB => Some(3),
        _ => None,
    }
}

impl GlBackend for SoftGlBackend {
    fn create_context(&mut self) -> u32 {
        let id = self.next_context;
        let Some(next) = id.checked_add(1) else {
            self.set_error(gl::OUT_OF_MEMORY);
            return 0;
        };
        self.next_context = next;
        self.contexts
            .insert(id, SoftContext::new(self.width, self.height));
        id
    }

    fn make_current(&mut self, context: u32) -> bool {
        if !self.contexts.contains_key(&context) {
            return false;
        }
        self.current = context;
        true
    }

    fn current_context(&self) -> u32 {
        self.current
    }

    fn resize(&mut self, width: u32, height: u32) {
        if (width, height) == (self.width, self.height) {
            return;
        }
        self.width = width;
        self.height = height;
        self.color = vec![0; width as usize * height as usize * 4];
    }

    fn drawable_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_frame_bgra(&mut self, dst: &mut [u8]) {
        let row_bytes = self.width as usize * 4;
        if row_bytes == 0 || dst.len() != row_bytes * self.height as usize {
            dst.fill(0);
            return;
        }
        for (dst_row, src_row) in dst
            .chunks_exact_mut(row_bytes)
            .zip(self.color.chunks_exact(row_bytes).rev())
        {
            for (d, s) in dst_row.chunks_exact_mut(4).zip(src_row.chunks_exact(4)) {
                d.copy_from_slice(&[s[2], s[1], s[0], s[3]]);
            }
        }
    }

    fn viewport(&mut self, x: i32, y: i32, width: i32, height: i32) {
        if width < 0 || height < 0 {
            return self.set_error(gl::INVALID_VALUE);
        }
        self.ctx().viewport = [x, y, width, height];
    }

    fn scissor(&mut self, x: i32, y: i32, width: i32, height: i32) {
        if width < 0 || height < 0 {
            return self.set_error(gl::INVALID_VALUE);
        }
        self.ctx().scissor = [x, y, width, height];
    }

    fn clear_color(&mut self, rgba: [f32; 4]) {
        self.ctx().clear_color = rgba.map(|c| c.clamp(0.0, 1.0));
    }

    fn clear_depth(&mut self, depth: f64) {
        self.ctx().clear_depth = depth.clamp(0.0, 1.0);
    }

    fn clear(&mut self, mask: u32) {
        let known = gl::COLOR_BUFFER_BIT | gl::DEPTH_BUFFER_BIT | gl::STENCIL_BUFFER_BIT;
        if mask & !known != 0 {
            return self.set_error(gl::INVALID_VALUE);
        }
        self.stats.clears += 1;
        if mask & gl::COLOR_BUFFER_BIT == 0 {
            return;
        }
        let rgba = self.ctx().clear_color.map(unorm8);
        let (x0, y0, x1, y1) = self.scissored_rect();
        let width = self.width as usize;
        for y in y0 as usize..y1 as usize {
            let row = &mut self.color[(y * width + x0 as usize) * 4..(y * width + x1 as usize) * 4];
            for pixel in row.chunks_exact_mut(4) {
                pixel.copy_from_slice(&rgba);
            }
        }
    }

    fn enable(&mut self, cap: u32) {
        if !CAPABILITIES.contains(&cap) {
            return self.set_error(gl::INVALID_ENUM);
        }
        self.ctx().caps.insert(cap);
    }

    fn disable(&mut self, cap: u32) {
        if !CAPABILITIES.contains(&cap) {
            return self.set_error(gl::INVALID_ENUM);
        }
        self.ctx().caps.remove(&cap);
    }

    fn is_enabled(&mut self, cap: u32) -> bool {
        if !CAPABILITIES.contains(&cap) {
            self.set_error(gl::INVALID_ENUM);
            return false;
        }
        self.ctx().caps.contains(&cap)
    }

    fn blend_func(&mut self, sfactor: u32, dfactor: u32) {
        if !BLEND_FACTORS.contains(&sfactor) || !BLEND_FACTORS.contains(&dfactor) {
            return self.set_error(gl::INVALID_ENUM);
        }
        self.ctx().blend = (sfactor, dfactor);
    }

    fn depth_func(&mut self, func: u32) {
        if !(gl::NEVER..=gl::ALWAYS).contains(&func) {
            return self.set_error(gl::INVALID_ENUM);
        }
        self.ctx().depth_func = func;
    }

    fn color4fv(&mut self, rgba: [f32; 4]) {
        self.ctx().color = rgba;
    }

    fn matrix_mode(&mut self, mode: u32) {
        if !matches!(mode, gl::MODELVIEW | gl::PROJECTION | gl::TEXTURE) {
            return self.set_error(gl::INVALID_ENUM);
        }
        self.ctx().matrix_mode = mode;
    }

    fn load_matrixf(&mut self, matrix: [f32; 16]) {
        let ctx = self.ctx();
        let index = (ctx.matrix_mode - gl::MODELVIEW) as usize;
        ctx.matrices[index] = matrix;
    }

    fn pixel_storei(&mut self, pname: u32, param: i32) {
        if !matches!(pname, gl::PACK_ALIGNMENT | gl::UNPACK_ALIGNMENT) {
            return self.set_error(gl::INVALID_ENUM);
        }
        if !matches!(param, 1 | 2 | 4 | 8) {
            return self.set_error(gl::INVALID_VALUE);
        }
        let ctx = self.ctx();
        if pname == gl::PACK_ALIGNMENT {
            ctx.pack_alignment = param;
        } else {
            ctx.unpack_alignment = param;
        }
    }

    fn depth_range(&mut self, near: f64, far: f64) {
        self.ctx().depth_range = [near.clamp(0.0, 1.0), far.clamp(0.0, 1.0)];
    }

    fn line_width(&mut self, width: f32) {
        if width <= 0.0 {
            return self.set_error(gl::INVALID_VALUE);
        }
        self.ctx().line_width = width;
    }

    fn get_error(&mut self) -> u32 {
        std::mem::replace(&mut self.ctx().error, gl::NO_ERROR)
    }

    fn get_integerv(&mut self, pname: u32) -> Vec<i32> {
        let version = self.version;
        let ctx = self.ctx();
        let values = match pname {
            gl::VIEWPORT => Some(ctx.viewport.to_vec()),
            gl::SCISSOR_BOX => Some(ctx.scissor.to_vec()),
            gl::DEPTH_FUNC => Some(vec![ctx.depth_func as i32]),
            gl::MATRIX_MODE => Some(vec![ctx.matrix_mode as i32]),
            gl::PACK_ALIGNMENT => Some(vec![ctx.pack_alignment]),
            gl::UNPACK_ALIGNMENT => Some(vec![ctx.unpack_alignment]),
            gl::ARRAY_BUFFER_BINDING => Some(vec![ctx.array_buffer as i32]),
            gl::TEXTURE_BINDING_2D => Some(vec![ctx.texture_2d as i32]),
            gl::MAX_TEXTURE_SIZE => Some(vec![MAX_TEXTURE_SIZE]),
            gl::MAJOR_VERSION => Some(vec![i32::from(version.major)]),
            gl::MINOR_VERSION => Some(vec![i32::from(version.minor)]),
            _ => None,
        };
        values.unwrap_or_else(|| {
            self.set_error(gl::INVALID_ENUM);
            Vec::new()
        })
    }

    fn get_floatv(&mut self, pname: u32) -> Vec<f32> {
        let ctx = self.ctx();
        let values = match pname {
            gl::COLOR_CLEAR_VALUE => Some(ctx.clear_color.to_vec()),
            gl::DEPTH_CLEAR_VALUE => Some(vec![ctx.clear_depth as f32]),
            gl::CURRENT_COLOR => Some(ctx.color.to_vec()),
            gl::LINE_WIDTH => Some(vec![ctx.line_width]),
            gl::DEPTH_RANGE => Some(ctx.depth_range.iter().map(|v| *v as f32).collect()),
            gl::VIEWPORT => Some(ctx.viewport.iter().map(|v| *v as f32).collect()),
            _ => None,
        };
        values.unwrap_or_else(|| {
            self.set_error(gl::INVALID_ENUM);
            Vec::new()
        })
    }

    fn get_string(&mut self, name: u32) -> Option<String> {
        let ApiVersion { major, minor } = self.version;
        match name {
            gl::VENDOR => Some("SGL".to_string()),
            gl::RENDERER => Some("SGL software rasterizer".to_string()),
            gl::VERSION => Some(format!("{major}.{minor} SGL")),
            gl::SHADING_LANGUAGE_VERSION => Some(format!("{major}.{minor}0")),
            _ => {
                self.set_error(gl::INVALID_ENUM);
                None
            }
        }
    }

    fn gen_buffers(&mut self, count: u32) -> Vec<u32> {
        let names = self.gen_names(count);
        for id in &names {
            self.buffers.insert(*id, Vec::new());
        }
        names
    }

    fn delete_buffers(&mut self, ids: &[u32]) {
        for id in ids {
            if *id == 0 || self.buffers.remove(id).is_none() {
                continue;
            }
            for ctx in self.contexts.values_mut() {
                if ctx.array_buffer == *id {
                    ctx.array_buffer = 0;
                }
                if ctx.element_buffer == *id {
                    ctx.element_buffer = 0;
                }
            }
        }
    }

    fn bind_buffer(&mut self, target: u32, id: u32) {
        if id != 0 && !self.buffers.contains_key(&id) {
            return self.set_error(gl::INVALID_OPERATION);
        }
        match target {
            gl::ARRAY_BUFFER => self.ctx().array_buffer = id,
            gl::ELEMENT_ARRAY_BUFFER => self.ctx().element_buffer = id,
            _ => self.set_error(gl::INVALID_ENUM),
        }
    }

    fn buffer_data(&mut self, target: u32, data: Vec<u8>, usage: u32) {
        if !matches!(usage, gl::STREAM_DRAW | gl::STATIC_DRAW | gl::DYNAMIC_DRAW) {
            return self.set_error(gl::INVALID_ENUM);
        }
        let Some(id) = self.bound_buffer(target) else {
            return;
        };
        self.buffers.insert(id, data);
    }

    fn buffer_sub_data(&mut self, target: u32, offset: u32, data: &[u8]) {
        let Some(id) = self.bound_buffer(target) else {
            return;
        };
        let offset = offset as usize;
        let written = self
            .buffers
            .get_mut(&id)
            .and_then(|buffer| buffer.get_mut(offset..offset.checked_add(data.len())?))
            .map(|dst| dst.copy_from_slice(data))
            .is_some();
        if !written {
            self.set_error(gl::INVALID_VALUE);
        }
    }

    fn get_buffer_sub_data(&mut self, target: u32, offset: u32, size: u32) -> Vec<u8> {
        let Some(id) = self.bound_buffer(target) else {
            return Vec::new();
        };
        let (offset, size) = (offset as usize, size as usize);
        let range = self
            .buffers
            .get(&id)
            .and_then(|b| b.get(offset..offset.checked_add(size)?))
            .map(<[u8]>::to_vec);
        range.unwrap_or_else(|| {
            self.set_error(gl::INVALID_VALUE);
            Vec::new()
        })
    }

    fn gen_textures(&mut self, count: u32) -> Vec<u32> {
        let names = self.gen_names(count);
        for id in &names {
            self.textures.insert(*id, SoftTexture::default());
        }
        names
    }

    fn delete_textures(&mut self, ids: &[u32]) {
        for id in ids {
            if *id == 0 || self.textures.remove(id).is_none() {
                continue;
            }
            for ctx in self.contexts.values_mut() {
                if ctx.texture_2d == *id {
                    ctx.texture_2d = 0;
                }
            }
        }
    }

    fn bind_texture(&mut self, target: u32, id: u32) {
        if target != gl::TEXTURE_2D {
            return self.set_error(gl::INVALID_ENUM);
        }
        if id != 0 && !self.textures.contains_key(&id) {
            return self.set_error(gl::INVALID_OPERATION);
        }
        self.ctx().texture_2d = id;
    }

    fn tex_parameteri(&mut self, target: u32, pname: u32, param: i32) {
        if target != gl::TEXTURE_2D {
            return self.set_error(gl::INVALID_ENUM);
        }
        if !matches!(
            pname,
            gl::TEXTURE_MIN_FILTER | gl::TEXTURE_MAG_FILTER | gl::TEXTURE_WRAP_S | gl::TEXTURE_WRAP_T
        ) {
            return self.set_error(gl::INVALID_ENUM);
        }
        let id = self.ctx().texture_2d;
        self.textures.entry(id).or_default().params.insert(pname, param);
    }

    fn tex_image_2d(
        &mut self,
        target: u32,
        level: i32,
        _internal_format: i32,
        width: i32,
        height: i32,
        format: u32,
        ty: u32,
        pixels: Vec<u8>,
    ) {
        if target != gl::TEXTURE_2D {
            return self.set_error(gl::INVALID_ENUM);
        }
        let Some(bpp) = bytes_per_pixel(format) else {
            return self.set_error(gl::INVALID_ENUM);
        };
        if ty != gl::UNSIGNED_BYTE {
            return self.set_error(gl::INVALID_ENUM);
        }
        if level < 0
            || !(0..=MAX_TEXTURE_SIZE).contains(&width)
            || !(0..=MAX_TEXTURE_SIZE).contains(&height)
        {
            return self.set_error(gl::INVALID_VALUE);
        }

        let align = self.ctx().unpack_alignment as usize;
        let packed_row = width as usize * bpp;
        let row_stride = packed_row.div_ceil(align) * align;
        let expected = match height as usize {
            0 => 0,
            rows => row_stride * (rows - 1) + packed_row,
        };
        if !pixels.is_empty() && pixels.len() < expected {
            return self.set_error(gl::INVALID_OPERATION);
        }

        let id = self.ctx().texture_2d;
        self.textures.entry(id).or_default().levels.insert(
            level,
            SoftImage {
                width,
                height,
                pixels,
            },
        );
    }

    fn draw_arrays(&mut self, mode: u32, first: i32, count: i32) {
        if mode > gl::TRIANGLE_FAN {
            return self.set_error(gl::INVALID_ENUM);
        }
        if first < 0 || count < 0 {
            return self.set_error(gl::INVALID_VALUE);
        }
        if self.ctx().array_buffer == 0 {
            return self.set_error(gl::INVALID_OPERATION);
        }
        self.stats.draw_calls += 1;
        self.stats.vertices += count as u64;
    }

    fn read_pixels(&mut self, x: i32, y: i32, width: i32, height: i32, format: u32, ty: u32) -> Vec<u8> {
        if !(0..=MAX_TEXTURE_SIZE).contains(&width) || !(0..=MAX_TEXTURE_SIZE).contains(&height) {
            self.set_error(gl::INVALID_VALUE);
            return Vec::new();
        }
        if !matches!(format, gl::RGBA | gl::BGRA) || ty != gl::UNSIGNED_BYTE {
            self.set_error(gl::INVALID_ENUM);
            return Vec::new();
        }

        let mut out = Vec::with_capacity(width as usize * height as usize * 4);
        for row in 0..height {
            for col in 0..width {
                let (px, py) = (i64::from(x) + i64::from(col), i64::from(y) + i64::from(row));
                let rgba = u32::try_from(px)
                    .ok()
                    .zip(u32::try_from(py).ok())
                    .and_then(|(px, py)| self.pixel(px, py))
                    .unwrap_or([0; 4]);
                if format == gl::BGRA {
                    out.extend_from_slice(&[rgba[2], rgba[1], rgba[0], rgba[3]]);
                } else {
                    out.extend_from_slice(&rgba);
                }
            }
        }
        out
    }

    fn finish(&mut self) {
        self.stats.finishes += 1;
    }

    fn flush(&mut self) {
        self.stats.flushes += 1;
    }

    fn fence_sync(&mut self, condition: u32, flags: u32) -> u32 {
        if condition != gl::SYNC_GPU_COMMANDS_COMPLETE {
            self.set_error(gl::INVALID_ENUM);
            return 0;
        }
        if flags != 0 {
            self.set_error(gl::INVALID_VALUE);
            return 0;
        }
        let id = self.next_sync;
        let Some(next) = id.checked_add(1) else {
            self.set_error(gl::OUT_OF_MEMORY);
            return 0;
        };
        self.next_sync = next;
        self.syncs.insert(id);
        id
    }

    fn client_wait_sync(&mut self, sync: u32, flags: u32, _timeout_ns: u64) -> u32 {
        if !self.syncs.contains(&sync) || flags & !gl::SYNC_FLUSH_COMMANDS_BIT != 0 {
            self.set_error(gl::INVALID_VALUE);
            return gl::WAIT_FAILED;
        }
        // Commands execute synchronously, so every fence is already signaled.
        gl::ALREADY_SIGNALED
    }
}
