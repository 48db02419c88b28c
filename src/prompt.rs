//! Builds the single composite instruction sent with an image edit.
//!
//! Images are numbered 1..N in role precedence: every subject image in capture
//! order, then outfit, place and pose when present. [`ImageOrdering`] assigns
//! those numbers while it fills the payload list, and the text is rendered from
//! the numbers it recorded, so the two can never disagree.

use crate::intake::{ReferenceImage, RoleSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub instruction: String,
    /// Payloads in the exact order the instruction refers to them.
    pub images: Vec<ReferenceImage>,
}

/// 1-based image numbers keyed by role, plus the payload list they index.
#[derive(Debug, Clone, Default)]
pub struct ImageOrdering {
    images: Vec<ReferenceImage>,
    subjects: Vec<usize>,
    outfit: Option<usize>,
    place: Option<usize>,
    pose: Option<usize>,
}

impl ImageOrdering {
    pub fn assign(roles: &RoleSet) -> Self {
        let mut ordering = Self::default();
        for img in &roles.subjects {
            let idx = ordering.push(img);
            ordering.subjects.push(idx);
        }
        ordering.outfit = roles.outfit.as_ref().map(|img| ordering.push(img));
        ordering.place = roles.place.as_ref().map(|img| ordering.push(img));
        ordering.pose = roles.pose.as_ref().map(|img| ordering.push(img));
        ordering
    }

    fn push(&mut self, img: &ReferenceImage) -> usize {
        self.images.push(img.clone());
        self.images.len()
    }

    pub fn subject_indices(&self) -> &[usize] {
        &self.subjects
    }

    pub fn outfit_index(&self) -> Option<usize> {
        self.outfit
    }

    pub fn place_index(&self) -> Option<usize> {
        self.place
    }

    pub fn pose_index(&self) -> Option<usize> {
        self.pose
    }

    pub fn into_images(self) -> Vec<ReferenceImage> {
        self.images
    }

    /// `Image 1` or `Images 1, 2, 3`.
    fn subject_reference(&self) -> String {
        let noun = if self.subjects.len() > 1 { "Images" } else { "Image" };
        format!("{noun} {}", self.subject_list())
    }

    fn subject_list(&self) -> String {
        self.subjects
            .iter()
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Pure: identical inputs produce an identical instruction and image order.
pub fn compose(
    roles: &RoleSet,
    instruction: &str,
    composition_hint: Option<&str>,
    negative: Option<&str>,
) -> ComposedPrompt {
    let ordering = ImageOrdering::assign(roles);
    let subjects = ordering.subject_reference();

    let mut out = format!(
        "Your mission is to forge a new, unique image with the highest possible fidelity to the source character's face. \
You are given multiple reference images. It is CRITICAL to synthesize these into a coherent, new piece of art and not simply copy one of them.

**CRITICAL INSTRUCTION: FACE FIDELITY PROTOCOL**
- You are provided with several images of the same character ({subjects}).
- Study these images carefully. The facial structure, features (eyes, nose, mouth), and unique details are your primary reference.
- The face in your generated image MUST be a highly accurate and consistent representation of this character. \
This is the most important part of your task. Do not change the character's identity.

**MISSION BRIEF:**
- {subjects} are the **SUBJECT CHARACTER**. Use them to understand the character's appearance, especially the face.
"
    );

    if let Some(idx) = ordering.outfit_index() {
        out.push_str(&outfit_directive(idx));
    }
    if let Some(idx) = ordering.place_index() {
        out.push_str(&place_directive(idx));
    }
    if let Some(idx) = ordering.pose_index() {
        out.push_str(&pose_directive(idx, &ordering.subject_list()));
    }

    out.push_str(
        "Combine all these elements into a single, cohesive, and new masterpiece. \
Finally, apply the following specific user instructions to the combined image: ",
    );
    out.push_str(instruction);

    if let Some(hint) = non_blank(composition_hint) {
        out.push_str(" --- POSE & COMPOSITION: ");
        out.push_str(hint);
    }
    if let Some(neg) = non_blank(negative) {
        out.push_str(" --- DO NOT INCLUDE THE FOLLOWING: ");
        out.push_str(neg);
    }

    ComposedPrompt {
        instruction: out,
        images: ordering.into_images(),
    }
}

fn outfit_directive(idx: usize) -> String {
    format!(
        "- Image {idx} is the **OUTFIT REFERENCE**. **OUTFIT REPLICATION MANDATE:** \
Your task is to take the complete outfit (all clothes, garments, and accessories) from this image and accurately dress the subject character in it. \
Replicate the style, color, design, and details of the clothing and any accessories precisely. \
IGNORE the person wearing the outfit in the reference; transfer ONLY the garments.\n"
    )
}

fn place_directive(idx: usize) -> String {
    format!(
        "- Image {idx} is the **PLACE/BACKGROUND REFERENCE**. The final scene's environment must match the style, mood, and elements of this image. \
**CRITICAL LIGHTING INSTRUCTION:** Pay close attention to the lighting conditions, color temperature, and shadow direction in this background image. \
The lighting on the subject character MUST be adjusted to match the environment perfectly, creating a natural and believable composite. \
Integrate the subject seamlessly into this new background.\n"
    )
}

fn pose_directive(idx: usize, subject_list: &str) -> String {
    format!(
        "- Image {idx} is the **POSE REFERENCE**. **CRITICAL POSE REPLICATION MANDATE (CONTROLNET SIMULATION):**
  - This image provides ONLY the anatomical pose for the subject character. Treat it as a structural guide, like a ControlNet reference or a digital mannequin.
  - Your SOLE TASK for this image is to extract the body position, posture, and limb arrangement of the figure.
  - You MUST apply this exact pose to the subject character defined by Image(s) {subject_list}.
  - **IT IS ABSOLUTELY FORBIDDEN TO COPY ANYTHING ELSE FROM THE POSE REFERENCE.** You MUST completely IGNORE and DISCARD the following from Image {idx}:
    - The person/character's identity, face, and body type.
    - ALL clothing, outfits, and garments.
    - ALL accessories (e.g., hats, jewelry, weapons).
    - The lighting, shadows, and color scheme.
    - The background and any environmental elements.
  - The purpose of this image is structural and anatomical ONLY. Replicate the pose and nothing else.\n"
    )
}

fn non_blank(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}
