use std::fmt;

/// Identifier the hub assigns to a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Light {
    id: DeviceId,
}

impl Light {
    pub fn new(id: DeviceId) -> Self {
        Self { id }
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }
}

/// Lights found by one discovery run, in hub order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LightRegistry {
    lights: Vec<Light>,
}

impl LightRegistry {
    pub fn new(lights: Vec<Light>) -> Self {
        Self { lights }
    }

    pub fn len(&self) -> usize {
        self.lights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lights.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Light> {
        self.lights.iter()
    }

    /// Drops every identifier and then the collection. Returns how many
    /// identifiers were freed; `None` and empty registries free nothing.
    pub fn release(registry: Option<Self>) -> usize {
        let Some(mut registry) = registry else {
            return 0;
        };

        let mut freed = 0;
        for light in registry.lights.drain(..) {
            drop(light);
            freed += 1;
        }
        freed
    }
}

impl<'a> IntoIterator for &'a LightRegistry {
    type Item = &'a Light;
    type IntoIter = std::slice::Iter<'a, Light>;

    fn into_iter(self) -> Self::IntoIter {
        self.lights.iter()
    }
}

impl IntoIterator for LightRegistry {
    type Item = Light;
    type IntoIter = std::vec::IntoIter<Light>;

    fn into_iter(self) -> Self::IntoIter {
        self.lights.into_iter()
    }
}
