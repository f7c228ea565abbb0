//! Camera: render target + draw-call command cache
//!
//! A camera owns the render pass and framebuffers for its target and one
//! secondary command buffer per attached renderer. Mutations set dirty flags
//! instead of touching the GPU; the display's per-frame update consumes the
//! flags and re-records exactly what went stale. A camera with no dirty
//! flags costs nothing to keep rendering.

use ash::vk;
use bitflags::bitflags;
use slotmap::new_key_type;

use crate::foundation::math::{Color, Rect};
use crate::render::graphics::display::TextureKey;
use crate::render::graphics::renderer::RendererKey;
use crate::render::vulkan::framebuffer::Framebuffer;
use crate::render::vulkan::render_pass::RenderPass;

pub use crate::render::vulkan::render_pass::ClearFlag as CameraClearFlags;

new_key_type! {
    /// Arena key for cameras
    pub struct CameraKey;
}

bitflags! {
    /// What a camera must rebuild before its next frame
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CameraDirty: u32 {
        /// Render pass and framebuffers must be recreated
        const RENDER_PASS = 1 << 0;
        /// Instance list must be re-sorted by material queue
        const RENDERER_ORDER = 1 << 1;
        /// One or more secondary command buffers must be re-recorded
        const INSTANCE_CMDS = 1 << 2;
        /// Clear values changed; only the primary recording is stale
        const CLEAR_VALUES = 1 << 3;
    }
}

/// Per-camera record of one attached renderer
pub struct RendererInstance {
    /// Renderer drawn by this instance
    pub renderer: RendererKey,
    /// Cached secondary command buffer, recorded lazily
    pub secondary_cmd: Option<vk::CommandBuffer>,
    /// Whether the secondary must be re-recorded
    pub cmd_dirty: bool,
}

/// View onto a render target with an ordered, cached list of draw calls
pub struct Camera {
    depth: i32,
    clear_flag: CameraClearFlags,
    clear_color: Color,
    viewport: Rect,
    target_color: Option<TextureKey>,
    target_depth: Option<TextureKey>,
    instances: Vec<RendererInstance>,
    render_pass: Option<RenderPass>,
    framebuffers: Vec<Framebuffer>,
    dirty: CameraDirty,
}

impl Camera {
    /// Create a camera targeting the swapchain.
    ///
    /// `depth` orders cameras within the frame; lower draws first.
    pub fn new(depth: i32) -> Self {
        Self {
            depth,
            clear_flag: CameraClearFlags::ColorAndDepth,
            clear_color: Color::black(),
            viewport: Rect::full(),
            target_color: None,
            target_depth: None,
            instances: Vec::new(),
            render_pass: None,
            framebuffers: Vec::new(),
            dirty: CameraDirty::RENDER_PASS,
        }
    }

    /// Camera draw-order depth
    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub(crate) fn set_depth(&mut self, depth: i32) {
        self.depth = depth;
    }

    /// Clear policy applied at pass begin
    pub fn clear_flag(&self) -> CameraClearFlags {
        self.clear_flag
    }

    /// Change the clear policy.
    ///
    /// Load ops are baked into the render pass, so this forces a pass
    /// rebuild and everything keyed by its handle.
    pub fn set_clear_flag(&mut self, flag: CameraClearFlags) {
        if self.clear_flag == flag {
            return;
        }
        self.clear_flag = flag;
        self.dirty |= CameraDirty::RENDER_PASS;
    }

    /// Clear color used when the color attachment clears
    pub fn clear_color(&self) -> Color {
        self.clear_color
    }

    /// Change the clear color. Only the primary recording goes stale; clear
    /// values live in the pass-begin command, not in the pass object.
    pub fn set_clear_color(&mut self, color: Color) {
        if self.clear_color == color {
            return;
        }
        self.clear_color = color;
        self.dirty |= CameraDirty::CLEAR_VALUES;
    }

    /// Normalized viewport within the target
    pub fn viewport(&self) -> Rect {
        self.viewport
    }

    /// Change the viewport. Viewport and scissor are recorded into every
    /// secondary, so all of them must re-record.
    pub fn set_viewport_rect(&mut self, rect: Rect) {
        if self.viewport == rect {
            return;
        }
        self.viewport = rect;
        self.mark_all_instances_dirty();
    }

    /// Offscreen color target, or None when targeting the swapchain
    pub fn target_color(&self) -> Option<TextureKey> {
        self.target_color
    }

    /// Offscreen depth target
    pub fn target_depth(&self) -> Option<TextureKey> {
        self.target_depth
    }

    /// Redirect the camera to an offscreen target (or back to the swapchain
    /// with `None`). The pass and framebuffers are rebuilt for the new
    /// attachments.
    pub fn set_render_target(
        &mut self,
        color: Option<TextureKey>,
        depth: Option<TextureKey>,
    ) {
        if self.target_color == color && self.target_depth == depth {
            return;
        }
        self.target_color = color;
        self.target_depth = depth;
        self.dirty |= CameraDirty::RENDER_PASS;
    }

    /// Whether this camera draws into the swapchain
    pub fn targets_swapchain(&self) -> bool {
        self.target_color.is_none()
    }

    /// Attach a renderer. It joins the draw list at its material's queue
    /// position after the next sort.
    pub fn add_renderer(&mut self, renderer: RendererKey) {
        if self.instances.iter().any(|i| i.renderer == renderer) {
            return;
        }
        self.instances.push(RendererInstance {
            renderer,
            secondary_cmd: None,
            cmd_dirty: true,
        });
        self.dirty |= CameraDirty::RENDERER_ORDER | CameraDirty::INSTANCE_CMDS;
    }

    /// Detach a renderer, returning its cached secondary for the caller to
    /// free once the GPU is idle
    pub fn remove_renderer(&mut self, renderer: RendererKey) -> Option<vk::CommandBuffer> {
        let index = self.instances.iter().position(|i| i.renderer == renderer)?;
        let instance = self.instances.remove(index);
        self.dirty |= CameraDirty::INSTANCE_CMDS;
        instance.secondary_cmd
    }

    /// Force re-recording of one renderer's secondary, e.g. after its
    /// material re-bound a texture
    pub fn mark_renderer_dirty(&mut self, renderer: RendererKey) {
        for instance in &mut self.instances {
            if instance.renderer == renderer {
                instance.cmd_dirty = true;
                self.dirty |= CameraDirty::INSTANCE_CMDS;
            }
        }
    }

    /// Force re-recording of every secondary
    pub fn mark_all_instances_dirty(&mut self) {
        for instance in &mut self.instances {
            instance.cmd_dirty = true;
        }
        self.dirty |= CameraDirty::INSTANCE_CMDS;
    }

    /// Stable-sort instances by resolved material queue, lower first.
    ///
    /// Renderers without a material sort ahead of everything; attachment
    /// order breaks ties. Clears the order flag.
    pub fn sort_instances(&mut self, queue_of: impl Fn(RendererKey) -> Option<i32>) {
        self.instances
            .sort_by_key(|instance| queue_of(instance.renderer).unwrap_or(i32::MIN));
        self.dirty.remove(CameraDirty::RENDERER_ORDER);
    }

    /// Attached renderer instances in draw order
    pub fn instances(&self) -> &[RendererInstance] {
        &self.instances
    }

    pub(crate) fn instances_mut(&mut self) -> &mut [RendererInstance] {
        &mut self.instances
    }

    /// Drain every cached secondary, leaving all instances dirty.
    /// Used when the render pass they were recorded against goes away.
    pub(crate) fn take_secondaries(&mut self) -> Vec<vk::CommandBuffer> {
        let mut taken = Vec::new();
        for instance in &mut self.instances {
            if let Some(cmd) = instance.secondary_cmd.take() {
                taken.push(cmd);
            }
            instance.cmd_dirty = true;
        }
        if !self.instances.is_empty() {
            self.dirty |= CameraDirty::INSTANCE_CMDS;
        }
        taken
    }

    /// Pending dirty flags
    pub fn dirty(&self) -> CameraDirty {
        self.dirty
    }

    pub(crate) fn clear_dirty(&mut self, flags: CameraDirty) {
        self.dirty.remove(flags);
    }

    pub(crate) fn mark_dirty(&mut self, flags: CameraDirty) {
        self.dirty |= flags;
    }

    /// Current render pass, once built
    pub fn render_pass(&self) -> Option<&RenderPass> {
        self.render_pass.as_ref()
    }

    pub(crate) fn framebuffers(&self) -> &[Framebuffer] {
        &self.framebuffers
    }

    /// Install freshly built pass objects and clear the pass flag.
    /// Returns the previous pass so the caller can purge pipelines keyed by
    /// its handle before it drops.
    pub(crate) fn attach_pass(
        &mut self,
        render_pass: RenderPass,
        framebuffers: Vec<Framebuffer>,
    ) -> Option<RenderPass> {
        let old = self.render_pass.replace(render_pass);
        self.framebuffers = framebuffers;
        self.dirty.remove(CameraDirty::RENDER_PASS);
        old
    }

    pub(crate) fn take_pass(&mut self) -> (Option<RenderPass>, Vec<Framebuffer>) {
        self.dirty |= CameraDirty::RENDER_PASS;
        (self.render_pass.take(), std::mem::take(&mut self.framebuffers))
    }

    /// Clear values for pass begin, in attachment order
    pub fn clear_values(&self) -> [vk::ClearValue; 2] {
        [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color.to_array(),
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn keys(count: usize) -> Vec<RendererKey> {
        let mut arena: SlotMap<RendererKey, ()> = SlotMap::with_key();
        (0..count).map(|_| arena.insert(())).collect()
    }

    #[test]
    fn test_new_camera_needs_a_pass() {
        let camera = Camera::new(0);
        assert_eq!(camera.dirty(), CameraDirty::RENDER_PASS);
    }

    #[test]
    fn test_clean_camera_stays_clean() {
        let mut camera = Camera::new(0);
        camera.clear_dirty(CameraDirty::all());

        // Re-applying current state must not dirty anything
        camera.set_clear_flag(camera.clear_flag());
        camera.set_clear_color(camera.clear_color());
        camera.set_viewport_rect(camera.viewport());
        camera.set_render_target(None, None);
        assert!(camera.dirty().is_empty());
    }

    #[test]
    fn test_clear_flag_rebuilds_pass() {
        let mut camera = Camera::new(0);
        camera.clear_dirty(CameraDirty::all());

        camera.set_clear_flag(CameraClearFlags::Depth);
        assert!(camera.dirty().contains(CameraDirty::RENDER_PASS));
    }

    #[test]
    fn test_clear_color_only_touches_primary() {
        let mut camera = Camera::new(0);
        camera.clear_dirty(CameraDirty::all());

        camera.set_clear_color(Color::white());
        assert_eq!(camera.dirty(), CameraDirty::CLEAR_VALUES);
    }

    #[test]
    fn test_viewport_rerecords_every_secondary() {
        let mut camera = Camera::new(0);
        let renderers = keys(2);
        camera.add_renderer(renderers[0]);
        camera.add_renderer(renderers[1]);
        camera.clear_dirty(CameraDirty::all());
        for instance in camera.instances_mut() {
            instance.cmd_dirty = false;
        }

        camera.set_viewport_rect(Rect::new(0.0, 0.0, 0.5, 0.5));
        assert!(camera.dirty().contains(CameraDirty::INSTANCE_CMDS));
        assert!(camera.instances().iter().all(|i| i.cmd_dirty));
    }

    #[test]
    fn test_add_renderer_is_idempotent() {
        let mut camera = Camera::new(0);
        let renderers = keys(1);
        camera.add_renderer(renderers[0]);
        camera.add_renderer(renderers[0]);
        assert_eq!(camera.instances().len(), 1);
    }

    #[test]
    fn test_remove_renderer_returns_cached_secondary() {
        let mut camera = Camera::new(0);
        let renderers = keys(1);
        camera.add_renderer(renderers[0]);
        assert_eq!(camera.remove_renderer(renderers[0]), None);
        assert!(camera.instances().is_empty());
    }

    #[test]
    fn test_sort_is_stable_and_queue_ordered() {
        let mut camera = Camera::new(0);
        let renderers = keys(4);
        for &r in &renderers {
            camera.add_renderer(r);
        }

        // renderers[1] and renderers[3] share a queue; attachment order must
        // hold between them
        let queue_of = |r: RendererKey| -> Option<i32> {
            if r == renderers[0] {
                Some(2000)
            } else if r == renderers[2] {
                None
            } else {
                Some(1000)
            }
        };

        camera.sort_instances(queue_of);
        let order: Vec<RendererKey> = camera.instances().iter().map(|i| i.renderer).collect();
        assert_eq!(
            order,
            vec![renderers[2], renderers[1], renderers[3], renderers[0]]
        );
        assert!(!camera.dirty().contains(CameraDirty::RENDERER_ORDER));
    }

    #[test]
    fn test_mark_renderer_dirty_targets_one_instance() {
        let mut camera = Camera::new(0);
        let renderers = keys(2);
        camera.add_renderer(renderers[0]);
        camera.add_renderer(renderers[1]);
        camera.clear_dirty(CameraDirty::all());
        for instance in camera.instances_mut() {
            instance.cmd_dirty = false;
        }

        camera.mark_renderer_dirty(renderers[1]);
        assert!(camera.dirty().contains(CameraDirty::INSTANCE_CMDS));
        assert!(!camera.instances()[0].cmd_dirty);
        assert!(camera.instances()[1].cmd_dirty);
    }
}
