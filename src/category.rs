//! Routing of jobs to generation styles, and the prompt text each style
//! sends to the model.

use crate::{non_blank, Combination, Job};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Fashion,
    Beauty,
    Eats,
    Cinema,
    Cartoon,
    Multiview,
    Landing,
}

impl Category {
    pub const STUDIO: [Category; 5] = [
        Category::Fashion,
        Category::Beauty,
        Category::Eats,
        Category::Cinema,
        Category::Cartoon,
    ];

    pub fn from_tag(tag: &str) -> Option<Category> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "fashion" => Some(Category::Fashion),
            "beauty" => Some(Category::Beauty),
            "eats" | "food" => Some(Category::Eats),
            "cinema" => Some(Category::Cinema),
            "cartoon" => Some(Category::Cartoon),
            "multiview" => Some(Category::Multiview),
            "landing" | "landing-demo" => Some(Category::Landing),
            _ => None,
        }
    }

    /// Categories a signed-in member may pick in the studio.
    pub fn parse_studio(tag: &str) -> Option<Category> {
        Category::from_tag(tag).filter(|c| Category::STUDIO.contains(c))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Fashion => "fashion",
            Category::Beauty => "beauty",
            Category::Eats => "eats",
            Category::Cinema => "cinema",
            Category::Cartoon => "cartoon",
            Category::Multiview => "multiview",
            Category::Landing => "landing",
        }
    }

    pub fn prompt_builder(self) -> &'static CategoryPrompt {
        match self {
            Category::Fashion => &FASHION,
            Category::Beauty => &BEAUTY,
            Category::Eats => &EATS,
            Category::Cinema => &CINEMA,
            Category::Cartoon => &CARTOON,
            Category::Multiview => &MULTIVIEW,
            Category::Landing => &LANDING,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Modify,
    Category(Category),
}

impl Route {
    /// Explicit `modify` jobs and legacy rows carrying a mask both go to
    /// the inpainting route. Everything else follows the route tag, with
    /// fashion as the fallback.
    pub fn resolve(job: &Job) -> Route {
        if job.job_type.eq_ignore_ascii_case("modify") || job.has_input_field("maskDataUrl") {
            return Route::Modify;
        }
        Route::Category(Category::from_tag(&job.route).unwrap_or(Category::Fashion))
    }

    pub fn prompt_builder(&self) -> &'static dyn PromptBuilder {
        match self {
            Route::Modify => &ModifyPrompt,
            Route::Category(category) => category.prompt_builder(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Modify => "modify",
            Route::Category(category) => category.as_str(),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic slot a reference image fills. Declaration order is the order
/// parts are sent to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReferenceRole {
    Background,
    Model,
    Clothing,
    Accessory,
    Reference,
    Mask,
}

impl ReferenceRole {
    /// Maps an attachment `type` tag. Unknown tags are not used.
    pub fn classify(kind: &str) -> Option<ReferenceRole> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "model" => Some(ReferenceRole::Model),
            "background" | "bg" => Some(ReferenceRole::Background),
            "top" | "pants" | "outer" => Some(ReferenceRole::Clothing),
            "shoes" | "bag" | "accessory" | "acce" | "none" | "product" => {
                Some(ReferenceRole::Accessory)
            }
            "reference" => Some(ReferenceRole::Reference),
            "mask" => Some(ReferenceRole::Mask),
            _ => None,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            ReferenceRole::Background => "the background / location to use exactly as shown",
            ReferenceRole::Model => "the person; keep face, body and proportions unchanged",
            ReferenceRole::Clothing => "clothing items the subject must wear, all of them",
            ReferenceRole::Accessory => "products and accessories that must appear",
            ReferenceRole::Reference => "the source image to work from",
            ReferenceRole::Mask => "paint strokes marking the only areas to change",
        }
    }
}

/// One planned image: camera angle and framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shot {
    pub angle: String,
    pub shot: String,
}

impl Default for Shot {
    fn default() -> Self {
        Shot {
            angle: "front".to_string(),
            shot: "full".to_string(),
        }
    }
}

impl Shot {
    pub fn angle_phrase(&self) -> &'static str {
        match self.angle.as_str() {
            "front" => "front-facing angle, direct eye contact with the camera",
            "side" => "side profile angle, 90-degree perspective",
            "profile" => "formal front-facing portrait with confident posture",
            "back" => "rear angle, back view composition",
            _ => "front view",
        }
    }

    pub fn shot_phrase(&self) -> &'static str {
        match self.shot.as_str() {
            "tight" => "close-up framing from the shoulders up",
            "middle" => "medium shot framed from the waist up",
            "full" => "full body shot, head to toe in frame",
            _ => "full body shot",
        }
    }
}

/// Expands combinations into exactly `total` shots, in order. Missing
/// quantities mean "as many as needed"; a short plan repeats its last shot.
pub fn shot_plan(combinations: &[Combination], total: usize) -> Vec<Shot> {
    let total = total.max(1);
    let mut plan = Vec::with_capacity(total);
    for combo in combinations {
        let shot = Shot {
            angle: non_blank(combo.angle.as_deref()).unwrap_or("front").to_string(),
            shot: non_blank(combo.shot.as_deref()).unwrap_or("full").to_string(),
        };
        let quantity = match combo.quantity {
            Some(q) if q > 0 => q as usize,
            _ => total,
        };
        for _ in 0..quantity {
            if plan.len() == total {
                return plan;
            }
            plan.push(shot.clone());
        }
    }
    let last = plan.last().cloned().unwrap_or_default();
    plan.resize(total, last);
    plan
}

pub struct PromptContext<'a> {
    pub user_prompt: &'a str,
    pub aspect_ratio: &'a str,
    /// Roles present in the request, in send order.
    pub roles: &'a [ReferenceRole],
    pub shot: Option<&'a Shot>,
}

pub trait PromptBuilder: Send + Sync {
    fn temperature(&self) -> f32 {
        0.45
    }

    fn build(&self, ctx: &PromptContext<'_>) -> String;
}

fn reference_lines(roles: &[ReferenceRole]) -> String {
    roles
        .iter()
        .enumerate()
        .map(|(i, role)| format!("Image {}: {}.\n", i + 1, role.describe()))
        .collect()
}

fn framing_line(aspect_ratio: &str) -> String {
    match aspect_ratio {
        "16:9" | "4:3" => format!("Compose for a {aspect_ratio} landscape frame, filling it edge to edge."),
        "9:16" | "3:4" => format!("Compose for a {aspect_ratio} portrait frame, filling it edge to edge."),
        _ => format!("Compose for a {aspect_ratio} frame."),
    }
}

/// Fixed house style per category.
pub struct CategoryPrompt {
    persona: &'static str,
    rules: &'static str,
}

static FASHION: CategoryPrompt = CategoryPrompt {
    persona: "You are a fashion photographer shooting an editorial campaign.",
    rules: "Exactly one model in frame. Every referenced garment and accessory is worn. \
            Natural proportions, no distortions.",
};

static BEAUTY: CategoryPrompt = CategoryPrompt {
    persona: "You are a beauty photographer shooting cosmetics and skincare.",
    rules: "Products keep their exact packaging, label and color. Skin looks real, with texture.",
};

static EATS: CategoryPrompt = CategoryPrompt {
    persona: "You are a food photographer shooting for a restaurant menu.",
    rules: "Dishes keep their real ingredients and plating. Appetizing light, shallow depth of field.",
};

static CINEMA: CategoryPrompt = CategoryPrompt {
    persona: "You are a cinematographer framing a still from a feature film.",
    rules: "Film grain, motivated lighting and a cinematic color grade. One coherent scene.",
};

static CARTOON: CategoryPrompt = CategoryPrompt {
    persona: "You are an illustrator drawing a finished cartoon panel.",
    rules: "Clean line art, flat consistent colors. Characters stay recognisable from the references.",
};

static MULTIVIEW: CategoryPrompt = CategoryPrompt {
    persona: "You are rendering the same subject from a different viewpoint.",
    rules: "Identity, materials and colors match the reference exactly; only the camera moves.",
};

static LANDING: CategoryPrompt = CategoryPrompt {
    persona: "You are a versatile photographer producing a polished showcase image.",
    rules: "Photorealistic, well lit, single coherent composition.",
};

impl PromptBuilder for CategoryPrompt {
    fn build(&self, ctx: &PromptContext<'_>) -> String {
        let mut prompt = format!("{}\n{}\n\n", self.persona, self.rules);
        prompt.push_str(&reference_lines(ctx.roles));
        if let Some(shot) = ctx.shot {
            prompt.push_str(&format!(
                "Camera: {}; {}.\n",
                shot.angle_phrase(),
                shot.shot_phrase()
            ));
        }
        prompt.push_str(&framing_line(ctx.aspect_ratio));
        prompt.push_str("\n\n");
        prompt.push_str(ctx.user_prompt);
        prompt
    }
}

/// Inpainting: change only what the mask marks.
pub struct ModifyPrompt;

impl PromptBuilder for ModifyPrompt {
    fn build(&self, ctx: &PromptContext<'_>) -> String {
        let mut prompt = String::from(
            "You are performing a precise inpainting task.\n\
             Only modify the areas marked with colored paint strokes. Everything else stays \
             pixel-identical: colors, lighting, depth and framing. Remove the paint strokes \
             from the output.\n\n",
        );
        prompt.push_str(&reference_lines(ctx.roles));
        prompt.push('\n');
        match non_blank(Some(ctx.user_prompt)) {
            Some(instruction) => {
                prompt.push_str("Modify the marked areas according to this instruction: ");
                prompt.push_str(instruction);
            }
            None => prompt.push_str(
                "Fill the marked areas with natural content matching their surroundings.",
            ),
        }
        prompt
    }
}

/// Instruction for turning an image back into a reusable prompt.
pub fn analyze_prompt(category: Category) -> String {
    format!(
        "Describe this image as a prompt an image model could use to recreate it in the {} \
         category. Cover subject, composition, lighting, palette and mood. Reply with the \
         prompt text only, no preamble.",
        category
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Status;
    use chrono::Utc;
    use sqlx::types::Json;

    fn job(job_type: &str, route: &str, input: serde_json::Value) -> Job {
        Job {
            job_id: "j".into(),
            job_type: job_type.into(),
            route: route.into(),
            status: Status::Pending,
            total_images: 1,
            completed_images: 0,
            generated_attachment_ids: vec![],
            production_id: None,
            member_id: None,
            org_id: None,
            input: Json(input),
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn routes_by_tag_with_fashion_fallback() {
        let empty = serde_json::json!({});
        assert_eq!(
            Route::resolve(&job("simple_general", "eats", empty.clone())),
            Route::Category(Category::Eats)
        );
        assert_eq!(
            Route::resolve(&job("simple_general", "", empty.clone())),
            Route::Category(Category::Fashion)
        );
        assert_eq!(
            Route::resolve(&job("simple_general", "unheard-of", empty)),
            Route::Category(Category::Fashion)
        );
    }

    #[test]
    fn mask_or_job_type_selects_modify() {
        assert_eq!(
            Route::resolve(&job("modify", "beauty", serde_json::json!({}))),
            Route::Modify
        );
        assert_eq!(
            Route::resolve(&job(
                "simple_general",
                "beauty",
                serde_json::json!({"maskDataUrl": "data:image/png;base64,AA=="})
            )),
            Route::Modify
        );
        assert_eq!(
            Route::resolve(&job("simple_general", "beauty", serde_json::json!({"maskDataUrl": null}))),
            Route::Category(Category::Beauty)
        );
    }

    #[test]
    fn studio_excludes_internal_categories() {
        assert_eq!(Category::parse_studio("Cinema"), Some(Category::Cinema));
        assert_eq!(Category::parse_studio("multiview"), None);
        assert_eq!(Category::parse_studio("landing"), None);
    }

    #[test]
    fn classifies_attachment_kinds() {
        assert_eq!(ReferenceRole::classify("bg"), Some(ReferenceRole::Background));
        assert_eq!(ReferenceRole::classify("outer"), Some(ReferenceRole::Clothing));
        assert_eq!(ReferenceRole::classify("product"), Some(ReferenceRole::Accessory));
        assert_eq!(ReferenceRole::classify("hat-ish"), None);
        assert!(ReferenceRole::Background < ReferenceRole::Model);
        assert!(ReferenceRole::Reference < ReferenceRole::Mask);
    }

    #[test]
    fn shot_plan_expands_then_pads_with_last() {
        let combos = vec![
            Combination {
                angle: Some("side".into()),
                shot: None,
                quantity: Some(2),
            },
            Combination {
                angle: None,
                shot: Some("tight".into()),
                quantity: Some(1),
            },
        ];
        let plan = shot_plan(&combos, 5);
        let pairs: Vec<_> = plan.iter().map(|s| (s.angle.as_str(), s.shot.as_str())).collect();
        assert_eq!(
            pairs,
            vec![
                ("side", "full"),
                ("side", "full"),
                ("front", "tight"),
                ("front", "tight"),
                ("front", "tight"),
            ]
        );

        assert_eq!(shot_plan(&combos, 1).len(), 1);
        assert_eq!(shot_plan(&[], 0), vec![Shot::default()]);
    }

    #[test]
    fn category_prompt_lists_roles_in_order() {
        let roles = [ReferenceRole::Background, ReferenceRole::Model];
        let shot = Shot::default();
        let prompt = Category::Fashion.prompt_builder().build(&PromptContext {
            user_prompt: "autumn street look",
            aspect_ratio: "9:16",
            roles: &roles,
            shot: Some(&shot),
        });

        let bg = prompt.find("Image 1: the background").unwrap();
        let model = prompt.find("Image 2: the person").unwrap();
        assert!(bg < model);
        assert!(prompt.contains("portrait frame"));
        assert!(prompt.ends_with("autumn street look"));
    }

    #[test]
    fn modify_prompt_without_instruction_fills_naturally() {
        let prompt = ModifyPrompt.build(&PromptContext {
            user_prompt: "  ",
            aspect_ratio: "1:1",
            roles: &[ReferenceRole::Reference, ReferenceRole::Mask],
            shot: None,
        });
        assert!(prompt.contains("Fill the marked areas"));
    }
}
