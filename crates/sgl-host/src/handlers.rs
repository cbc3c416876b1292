//! Command id → backend invocation table.
//!
//! Each handler unmarshals the arguments of one decoded [`Call`], invokes the
//! [`GlBackend`] and returns a [`Reply`] matching the command's return kind.
//! Pseudo-commands that touch the segment or the session (see
//! [`crate::dispatcher::BUILTIN_COMMANDS`]) are not in the table.

use sgl_protocol::codec::{check_vector_len, f32s_to_bytes, i32s_to_bytes, u32s_to_bytes};
use sgl_protocol::layout::pack_dims;
use sgl_protocol::{Call, CodecError, CommandId};

use crate::backend::GlBackend;

/// Result of a handler, before it is written to the segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    None,
    Scalar(u32),
    /// Bytes for the `retval_vector` slot.
    Vector(Vec<u8>),
    /// Bytes staged for a bulk download; `retval` carries the total.
    Download(Vec<u8>),
}

/// `staged` holds the bytes of the preceding bulk upload and is empty unless
/// the command takes a `Staged` argument.
pub type Handler = fn(&mut dyn GlBackend, &Call, Vec<u8>) -> Result<Reply, CodecError>;

pub static HANDLERS: &[(CommandId, Handler)] = &[
    (CommandId::GetContext, get_context),
    (CommandId::SetContext, set_context),
    (CommandId::GetSize, get_size),
    (CommandId::CreateContext, create_context),
    (CommandId::Viewport, viewport),
    (CommandId::Scissor, scissor),
    (CommandId::ClearColor, clear_color),
    (CommandId::ClearDepth, clear_depth),
    (CommandId::Clear, clear),
    (CommandId::Enable, enable),
    (CommandId::Disable, disable),
    (CommandId::IsEnabled, is_enabled),
    (CommandId::BlendFunc, blend_func),
    (CommandId::DepthFunc, depth_func),
    (CommandId::GetError, get_error),
    (CommandId::GetIntegerv, get_integerv),
    (CommandId::GetFloatv, get_floatv),
    (CommandId::GetString, get_string),
    (CommandId::GenBuffers, gen_buffers),
    (CommandId::DeleteBuffers, delete_buffers),
    (CommandId::BindBuffer, bind_buffer),
    (CommandId::BufferData, buffer_data),
    (CommandId::BufferSubData, buffer_sub_data),
    (CommandId::GetBufferSubData, get_buffer_sub_data),
    (CommandId::GenTextures, gen_textures),
    (CommandId::DeleteTextures, delete_textures),
    (CommandId::BindTexture, bind_texture),
    (CommandId::TexParameteri, tex_parameteri),
    (CommandId::TexImage2D, tex_image_2d),
    (CommandId::DrawArrays, draw_arrays),
    (CommandId::ReadPixels, read_pixels),
    (CommandId::Finish, finish),
    (CommandId::Flush, flush),
    (CommandId::Color4fv, color4fv),
    (CommandId::MatrixMode, matrix_mode),
    (CommandId::LoadMatrixf, load_matrixf),
    (CommandId::PixelStorei, pixel_storei),
    (CommandId::DepthRange, depth_range),
    (CommandId::LineWidth, line_width),
    (CommandId::FenceSync, fence_sync),
    (CommandId::ClientWaitSync, client_wait_sync),
];

pub fn handler(id: CommandId) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(candidate, _)| *candidate == id)
        .map(|(_, handler)| *handler)
}

fn f32_array<const N: usize>(call: &Call, index: usize) -> Result<[f32; N], CodecError> {
    let values = call.f32_array(index)?;
    values.try_into().map_err(|_| CodecError::ArrayLength {
        command: call.id.name(),
        index,
        expected: N,
        found: values.len(),
    })
}

/// Generated names go back as a vector; refuse counts the slot cannot hold
/// before the backend allocates anything.
fn check_name_count(count: u32) -> Result<(), CodecError> {
    check_vector_len((count as usize).saturating_mul(4))
}

fn get_context(gl: &mut dyn GlBackend, _: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    Ok(Reply::Scalar(gl.current_context()))
}

fn set_context(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    Ok(Reply::Scalar(u32::from(gl.make_current(call.u32(0)?))))
}

fn get_size(gl: &mut dyn GlBackend, _: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    let (width, height) = gl.drawable_size();
    Ok(Reply::Scalar(pack_dims(width, height)))
}

fn create_context(gl: &mut dyn GlBackend, _: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    Ok(Reply::Scalar(gl.create_context()))
}

fn viewport(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.viewport(call.i32(0)?, call.i32(1)?, call.i32(2)?, call.i32(3)?);
    Ok(Reply::None)
}

fn scissor(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.scissor(call.i32(0)?, call.i32(1)?, call.i32(2)?, call.i32(3)?);
    Ok(Reply::None)
}

fn clear_color(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.clear_color([call.f32(0)?, call.f32(1)?, call.f32(2)?, call.f32(3)?]);
    Ok(Reply::None)
}

fn clear_depth(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.clear_depth(call.f64(0)?);
    Ok(Reply::None)
}

fn clear(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.clear(call.u32(0)?);
    Ok(Reply::None)
}

fn enable(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.enable(call.u32(0)?);
    Ok(Reply::None)
}

fn disable(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.disable(call.u32(0)?);
    Ok(Reply::None)
}

fn is_enabled(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    Ok(Reply::Scalar(u32::from(gl.is_enabled(call.u32(0)?))))
}

fn blend_func(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.blend_func(call.u32(0)?, call.u32(1)?);
    Ok(Reply::None)
}

fn depth_func(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.depth_func(call.u32(0)?);
    Ok(Reply::None)
}

fn get_error(gl: &mut dyn GlBackend, _: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    Ok(Reply::Scalar(gl.get_error()))
}

fn get_integerv(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    Ok(Reply::Vector(i32s_to_bytes(&gl.get_integerv(call.u32(0)?))))
}

fn get_floatv(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    Ok(Reply::Vector(f32s_to_bytes(&gl.get_floatv(call.u32(0)?))))
}

/// NUL-terminated, like the C API. An unknown name yields an empty vector.
fn get_string(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    let bytes = match gl.get_string(call.u32(0)?) {
        Some(text) => {
            let mut bytes = text.into_bytes();
            bytes.push(0);
            bytes
        }
        None => Vec::new(),
    };
    Ok(Reply::Vector(bytes))
}

fn gen_buffers(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    let count = call.u32(0)?;
    check_name_count(count)?;
    Ok(Reply::Vector(u32s_to_bytes(&gl.gen_buffers(count))))
}

fn delete_buffers(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.delete_buffers(call.u32_slice(0)?);
    Ok(Reply::None)
}

fn bind_buffer(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.bind_buffer(call.u32(0)?, call.u32(1)?);
    Ok(Reply::None)
}

fn buffer_data(gl: &mut dyn GlBackend, call: &Call, staged: Vec<u8>) -> Result<Reply, CodecError> {
    gl.buffer_data(call.u32(0)?, staged, call.u32(1)?);
    Ok(Reply::None)
}

fn buffer_sub_data(
    gl: &mut dyn GlBackend,
    call: &Call,
    staged: Vec<u8>,
) -> Result<Reply, CodecError> {
    gl.buffer_sub_data(call.u32(0)?, call.u32(1)?, &staged);
    Ok(Reply::None)
}

fn get_buffer_sub_data(
    gl: &mut dyn GlBackend,
    call: &Call,
    _: Vec<u8>,
) -> Result<Reply, CodecError> {
    let data = gl.get_buffer_sub_data(call.u32(0)?, call.u32(1)?, call.u32(2)?);
    Ok(Reply::Download(data))
}

fn gen_textures(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    let count = call.u32(0)?;
    check_name_count(count)?;
    Ok(Reply::Vector(u32s_to_bytes(&gl.gen_textures(count))))
}

fn delete_textures(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.delete_textures(call.u32_slice(0)?);
    Ok(Reply::None)
}

fn bind_texture(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.bind_texture(call.u32(0)?, call.u32(1)?);
    Ok(Reply::None)
}

fn tex_parameteri(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.tex_parameteri(call.u32(0)?, call.u32(1)?, call.i32(2)?);
    Ok(Reply::None)
}

fn tex_image_2d(gl: &mut dyn GlBackend, call: &Call, staged: Vec<u8>) -> Result<Reply, CodecError> {
    gl.tex_image_2d(
        call.u32(0)?,
        call.i32(1)?,
        call.i32(2)?,
        call.i32(3)?,
        call.i32(4)?,
        call.u32(5)?,
        call.u32(6)?,
        staged,
    );
    Ok(Reply::None)
}

fn draw_arrays(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.draw_arrays(call.u32(0)?, call.i32(1)?, call.i32(2)?);
    Ok(Reply::None)
}

fn read_pixels(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    let pixels = gl.read_pixels(
        call.i32(0)?,
        call.i32(1)?,
        call.i32(2)?,
        call.i32(3)?,
        call.u32(4)?,
        call.u32(5)?,
    );
    Ok(Reply::Download(pixels))
}

fn finish(gl: &mut dyn GlBackend, _: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.finish();
    Ok(Reply::None)
}

fn flush(gl: &mut dyn GlBackend, _: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.flush();
    Ok(Reply::None)
}

fn color4fv(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.color4fv(f32_array(call, 0)?);
    Ok(Reply::None)
}

fn matrix_mode(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.matrix_mode(call.u32(0)?);
    Ok(Reply::None)
}

fn load_matrixf(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.load_matrixf(f32_array(call, 0)?);
    Ok(Reply::None)
}

fn pixel_storei(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.pixel_storei(call.u32(0)?, call.i32(1)?);
    Ok(Reply::None)
}

fn depth_range(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.depth_range(call.f64(0)?, call.f64(1)?);
    Ok(Reply::None)
}

fn line_width(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    gl.line_width(call.f32(0)?);
    Ok(Reply::None)
}

fn fence_sync(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    Ok(Reply::Scalar(gl.fence_sync(call.u32(0)?, call.u32(1)?)))
}

fn client_wait_sync(gl: &mut dyn GlBackend, call: &Call, _: Vec<u8>) -> Result<Reply, CodecError> {
    let status = gl.client_wait_sync(call.u32(0)?, call.u32(1)?, call.u64(2)?);
    Ok(Reply::Scalar(status))
}
