//! SDL2 window display for NV12 multi-planar frames.
//! Handles window creation, event polling, and vsync'd frame presentation
//! with GPU-accelerated texture upload.

use std::time::Instant;

use sdl2::event::Event;
use sdl2::keyboard::Keycode;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Canvas, TextureCreator};
use sdl2::video::{Window, WindowContext};
use sdl2::EventPump;
use tracing::{debug, info};

use crate::display::{FrameHandoff, RenderStatus, Renderer};
use crate::error::DisplayError;

/// SDL2 window display.
/// Uploads the luma and chroma planes of each frame to an NV12 streaming
/// texture and presents under vsync.
pub struct Sdl2Display {
    canvas: Canvas<Window>,
    texture_creator: TextureCreator<WindowContext>,
    event_pump: EventPump,
    quit_requested: bool,
}

impl Sdl2Display {
    pub fn new(
        sdl_context: &sdl2::Sdl,
        width: u32,
        height: u32,
        fullscreen: bool,
    ) -> Result<Self, DisplayError> {
        let video_subsystem = sdl_context.video().map_err(DisplayError)?;

        let mut window_builder = video_subsystem.window("Helios", width, height);
        window_builder.position_centered();
        if fullscreen {
            window_builder.fullscreen_desktop();
        }
        let window = window_builder
            .build()
            .map_err(|e| DisplayError(e.to_string()))?;

        let canvas = window
            .into_canvas()
            .present_vsync()
            .build()
            .map_err(|e| DisplayError(e.to_string()))?;
        let texture_creator = canvas.texture_creator();
        let event_pump = sdl_context.event_pump().map_err(DisplayError)?;

        Ok(Self {
            canvas,
            texture_creator,
            event_pump,
            quit_requested: false,
        })
    }

    fn key_char(code: Keycode) -> Option<char> {
        match code {
            Keycode::A => Some('a'),
            Keycode::F => Some('f'),
            Keycode::P => Some('p'),
            Keycode::T => Some('t'),
            Keycode::L => Some('l'),
            Keycode::H => Some('h'),
            _ => None,
        }
    }
}

impl Renderer for Sdl2Display {
    fn setup(&mut self, hint: &FrameHandoff<'_>) -> Result<(), DisplayError> {
        if hint.planes.iter().any(|p| p.data.is_empty()) {
            return Err(DisplayError(
                "no buffer address in render handoff".to_string(),
            ));
        }
        info!("Display ready for {}x{} NV12 frames", hint.width, hint.height);
        Ok(())
    }

    fn poll_keys(&mut self) -> Vec<char> {
        let mut keys = Vec::new();
        for event in self.event_pump.poll_iter() {
            match event {
                Event::Quit { .. } => {
                    info!("Quit event received");
                    self.quit_requested = true;
                }
                Event::KeyDown {
                    keycode: Some(code),
                    ..
                } => match code {
                    Keycode::Q | Keycode::Escape => self.quit_requested = true,
                    _ => {
                        if let Some(ch) = Self::key_char(code) {
                            keys.push(ch);
                        }
                    }
                },
                _ => {}
            }
        }
        keys
    }

    fn render(&mut self, frame: &FrameHandoff<'_>) -> Result<RenderStatus, DisplayError> {
        if self.quit_requested {
            debug!("quit requested, skipping render");
            return Ok(RenderStatus::Quit);
        }

        let [luma, chroma] = &frame.planes;
        if luma.data.is_empty() || chroma.data.is_empty() {
            return Err(DisplayError(
                "no buffer address in render handoff".to_string(),
            ));
        }

        let render_start = Instant::now();

        let texture = self
            .texture_creator
            .create_texture_streaming(PixelFormatEnum::NV12, frame.width, frame.height)
            .map_err(|e| DisplayError(e.to_string()))?;

        // The safe wrapper has no two-plane update; SDL_UpdateNVTexture
        // copies straight from the mapped luma/chroma addresses.
        let rc = unsafe {
            sdl2::sys::SDL_UpdateNVTexture(
                texture.raw(),
                std::ptr::null(),
                luma.data.as_ptr(),
                luma.stride as i32,
                chroma.data.as_ptr(),
                chroma.stride as i32,
            )
        };
        if rc != 0 {
            return Err(DisplayError(sdl2::get_error()));
        }

        self.canvas.clear();
        self.canvas.copy(&texture, None, None).map_err(DisplayError)?;
        // present blocks until the vsync'd swap; the planes are on the GPU
        // once it returns and the buffer may go back to the kernel
        self.canvas.present();

        metrics::histogram!("render_time_us").record(render_start.elapsed().as_micros() as f64);

        Ok(RenderStatus::Continue)
    }
}
