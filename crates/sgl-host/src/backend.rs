//! Graphics backend abstraction.
//!
//! The dispatcher is backend-agnostic: every decoded command ends up as one
//! call on a [`GlBackend`]. Methods follow GL semantics, so invalid arguments
//! are recorded in the backend's error flag (read back with
//! [`GlBackend::get_error`]) instead of failing the protocol cycle.

/// Host-side executor for decoded commands.
pub trait GlBackend {
    // Contexts and the drawable.

    /// Creates a context and returns its nonzero id.
    fn create_context(&mut self) -> u32;
    /// Makes `context` current. Returns `false` for unknown ids.
    fn make_current(&mut self, context: u32) -> bool;
    fn current_context(&self) -> u32;
    fn resize(&mut self, width: u32, height: u32);
    fn drawable_size(&self) -> (u32, u32);
    /// Writes the colour buffer into `dst` as BGRA8, top row first, tightly
    /// packed. `dst` holds exactly `width * height * 4` bytes of the current
    /// drawable.
    fn read_frame_bgra(&mut self, dst: &mut [u8]);

    // Fixed-function state.

    fn viewport(&mut self, x: i32, y: i32, width: i32, height: i32);
    fn scissor(&mut self, x: i32, y: i32, width: i32, height: i32);
    fn clear_color(&mut self, rgba: [f32; 4]);
    fn clear_depth(&mut self, depth: f64);
    fn clear(&mut self, mask: u32);
    fn enable(&mut self, cap: u32);
    fn disable(&mut self, cap: u32);
    fn is_enabled(&mut self, cap: u32) -> bool;
    fn blend_func(&mut self, sfactor: u32, dfactor: u32);
    fn depth_func(&mut self, func: u32);
    fn color4fv(&mut self, rgba: [f32; 4]);
    fn matrix_mode(&mut self, mode: u32);
    fn load_matrixf(&mut self, matrix: [f32; 16]);
    fn pixel_storei(&mut self, pname: u32, param: i32);
    fn depth_range(&mut self, near: f64, far: f64);
    fn line_width(&mut self, width: f32);

    // Queries.

    /// Returns and clears the recorded error.
    fn get_error(&mut self) -> u32;
    fn get_integerv(&mut self, pname: u32) -> Vec<i32>;
    fn get_floatv(&mut self, pname: u32) -> Vec<f32>;
    fn get_string(&mut self, name: u32) -> Option<String>;

    // Buffer objects.

    fn gen_buffers(&mut self, count: u32) -> Vec<u32>;
    fn delete_buffers(&mut self, ids: &[u32]);
    fn bind_buffer(&mut self, target: u32, id: u32);
    fn buffer_data(&mut self, target: u32, data: Vec<u8>, usage: u32);
    fn buffer_sub_data(&mut self, target: u32, offset: u32, data: &[u8]);
    fn get_buffer_sub_data(&mut self, target: u32, offset: u32, size: u32) -> Vec<u8>;

    // Textures.

    fn gen_textures(&mut self, count: u32) -> Vec<u32>;
    fn delete_textures(&mut self, ids: &[u32]);
    fn bind_texture(&mut self, target: u32, id: u32);
    fn tex_parameteri(&mut self, target: u32, pname: u32, param: i32);
    #[allow(clippy::too_many_arguments)]
    fn tex_image_2d(
        &mut self,
        target: u32,
        level: i32,
        internal_format: i32,
        width: i32,
        height: i32,
        format: u32,
        ty: u32,
        pixels: Vec<u8>,
    );

    // Drawing and readback.

    fn draw_arrays(&mut self, mode: u32, first: i32, count: i32);
    /// Reads a rectangle of the colour buffer, bottom row first.
    fn read_pixels(&mut self, x: i32, y: i32, width: i32, height: i32, format: u32, ty: u32) -> Vec<u8>;
    fn finish(&mut self);
    fn flush(&mut self);

    // Sync objects.

    fn fence_sync(&mut self, condition: u32, flags: u32) -> u32;
    fn client_wait_sync(&mut self, sync: u32, flags: u32, timeout_ns: u64) -> u32;
}
