use serde::Serialize;

/// How a person is presented on screen and by the lookup endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelProfile {
    /// Fixed caption, or `None` to caption with the recognized name.
    pub caption: Option<String>,
    pub counselor_name: String,
    pub counselor_image: String,
    /// Box and caption colour, BGR.
    pub color: [u8; 3],
}

/// Maps recognized names onto presentation profiles.
///
/// Names whose lowercased first letter sorts before `split` get the first
/// profile, everything else the second. Unknown faces get `unknown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelPolicy {
    pub split: char,
    pub unknown: LabelProfile,
    pub profiles: [LabelProfile; 2],
}

impl Default for LabelPolicy {
    fn default() -> Self {
        Self {
            split: 'k',
            unknown: LabelProfile {
                caption: Some("Who are you?".to_owned()),
                counselor_name: "Nope".to_owned(),
                counselor_image: "none.jpg".to_owned(),
                color: [0, 0, 255],
            },
            profiles: [
                LabelProfile {
                    caption: None,
                    counselor_name: "Wink".to_owned(),
                    counselor_image: "wink.jpg".to_owned(),
                    color: [255, 0, 0],
                },
                LabelProfile {
                    caption: None,
                    counselor_name: "Lizzie".to_owned(),
                    counselor_image: "lizzie.jpg".to_owned(),
                    color: [255, 0, 160],
                },
            ],
        }
    }
}

/// Body of the `/face` lookup endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FaceLookup {
    #[serde(rename = "studentname")]
    pub student_name: String,
    #[serde(rename = "counselorname")]
    pub counselor_name: String,
    #[serde(rename = "counselorimage")]
    pub counselor_image: String,
}

impl LabelPolicy {
    pub fn resolve(&self, name: &str) -> &LabelProfile {
        let Some(first) = name.chars().next() else {
            return &self.unknown;
        };
        let first = first.to_lowercase().next().unwrap_or(first);
        let split = self.split.to_lowercase().next().unwrap_or(self.split);
        if first < split {
            &self.profiles[0]
        } else {
            &self.profiles[1]
        }
    }

    pub fn caption(&self, name: &str) -> String {
        match &self.resolve(name).caption {
            Some(caption) => caption.clone(),
            None => name.to_owned(),
        }
    }

    pub fn lookup(&self, name: &str) -> FaceLookup {
        let profile = self.resolve(name);
        FaceLookup {
            student_name: self.caption(name),
            counselor_name: profile.counselor_name.clone(),
            counselor_image: profile.counselor_image.clone(),
        }
    }
}
