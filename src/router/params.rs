// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Captured path parameters, small-array optimized for the common case of
//! at most 4 parameters (spec §3/§4.5), spilling to the heap beyond that.

const INLINE: usize = 4;

#[derive(Debug, Clone)]
enum Storage<'p> {
    Inline([Option<(&'static str, &'p str)>; INLINE], usize),
    Spilled(Vec<(&'static str, &'p str)>),
}

/// Path parameters captured while matching a route, keyed by the `:name`/
/// `*name` used in the pattern.
#[derive(Debug, Clone)]
pub struct Params<'p> {
    storage: Storage<'p>,
}

impl<'p> Params<'p> {
    /// An empty parameter set.
    pub fn new() -> Self {
        Params {
            storage: Storage::Inline([None, None, None, None], 0),
        }
    }

    /// Appends a captured `(name, value)` pair. `name` is already the
    /// `'static` key interned once for this segment when its route was
    /// registered (see `router::intern`/`split_pattern`); matching a request
    /// never allocates to produce it.
    pub(crate) fn push(&mut self, name: &'static str, value: &'p str) {
        match &mut self.storage {
            Storage::Inline(slots, len) => {
                if *len < INLINE {
                    slots[*len] = Some((name, value));
                    *len += 1;
                } else {
                    let mut spilled: Vec<_> = slots.iter().filter_map(|s| *s).collect();
                    spilled.push((name, value));
                    self.storage = Storage::Spilled(spilled);
                }
            }
            Storage::Spilled(vec) => vec.push((name, value)),
        }
    }

    /// Looks up a captured parameter by name.
    pub fn get(&self, name: &str) -> Option<&'p str> {
        match &self.storage {
            Storage::Inline(slots, len) => slots[..*len]
                .iter()
                .filter_map(|s| *s)
                .find(|(n, _)| *n == name)
                .map(|(_, v)| v),
            Storage::Spilled(vec) => vec.iter().find(|(n, _)| *n == name).map(|(_, v)| v),
        }
    }

    /// Number of captured parameters.
    pub fn len(&self) -> usize {
        match &self.storage {
            Storage::Inline(_, len) => *len,
            Storage::Spilled(vec) => vec.len(),
        }
    }

    /// Whether no parameters were captured.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over captured `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &'p str)> + '_ {
        match &self.storage {
            Storage::Inline(slots, len) => slots[..*len].iter().filter_map(|s| *s).collect::<Vec<_>>().into_iter(),
            Storage::Spilled(vec) => vec.clone().into_iter(),
        }
    }
}

impl Default for Params<'_> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_storage_holds_up_to_four() {
        let mut params = Params::new();
        params.push("a", "1");
        params.push("b", "2");
        params.push("c", "3");
        params.push("d", "4");
        assert_eq!(params.len(), 4);
        assert_eq!(params.get("c"), Some("3"));
    }

    #[test]
    fn spills_beyond_four() {
        let mut params = Params::new();
        for (i, name) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            params.push(*name, Box::leak(i.to_string().into_boxed_str()));
        }
        assert_eq!(params.len(), 5);
        assert_eq!(params.get("e"), Some("4"));
    }

    #[test]
    fn missing_param_is_none() {
        let params = Params::new();
        assert_eq!(params.get("missing"), None);
    }
}
