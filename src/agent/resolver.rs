//! Locate Resolver: bounding box, then cache, then the locate service.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::cache::TaskCache;
use crate::device::Device;
use crate::error::EngineError;
use crate::model::LocateService;
use crate::types::{
    ElementCacheFeature, HitBy, HitSource, LocateParam, LocateResultElement, Point, UiContext,
};

/// A resolved element and how it was found.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub element: LocateResultElement,
    pub hit_by: HitBy,
}

impl Resolution {
    pub fn from_cache(&self) -> bool {
        self.hit_by.from == HitSource::Cache
    }
}

/// Resolves target descriptions to elements, maintaining the locate cache.
pub struct LocateResolver {
    device: Arc<dyn Device>,
    locator: Arc<dyn LocateService>,
    cache: Option<Arc<TaskCache>>,
}

impl LocateResolver {
    pub fn new(
        device: Arc<dyn Device>,
        locator: Arc<dyn LocateService>,
        cache: Option<Arc<TaskCache>>,
    ) -> Self {
        Self {
            device,
            locator,
            cache,
        }
    }

    pub fn cache(&self) -> Option<&Arc<TaskCache>> {
        self.cache.as_ref()
    }

    /// Resolve `param` against `context`. First success wins.
    pub async fn resolve(
        &self,
        param: &LocateParam,
        context: &UiContext,
    ) -> Result<Resolution, EngineError> {
        if param.is_empty() {
            return Err(EngineError::InvalidParam(
                "locate param needs a prompt or a bbox".to_string(),
            ));
        }
        let prompt = param.prompt.as_str();
        let cache = self.cache.as_ref().filter(|_| param.cache_allowed());

        if let Some(bbox) = param.bbox {
            let element = LocateResultElement::from_bbox(bbox).with_description(prompt);
            tracing::debug!("Resolved \"{}\" from planner bbox {:?}", prompt, bbox);
            if let Some(cache) = cache {
                if !prompt.is_empty() && !cache.has_locate_record(prompt) {
                    self.record_feature(cache, prompt, element.center, false).await;
                }
            }
            return Ok(Resolution {
                element,
                hit_by: HitBy::new(HitSource::Plan, json!({ "prompt": prompt, "bbox": bbox })),
            });
        }

        let mut stale = false;
        if let Some(cache) = cache {
            if let Some(record) = cache.match_locate_cache(prompt, true) {
                match record.cache.filter(|feature| !feature.is_empty()) {
                    Some(feature) => match self.validate(prompt, &feature).await {
                        Ok(element) => {
                            tracing::debug!("Resolved \"{}\" from cache", prompt);
                            return Ok(Resolution {
                                element,
                                hit_by: HitBy::new(
                                    HitSource::Cache,
                                    json!({ "prompt": prompt, "cache": feature }),
                                ),
                            });
                        }
                        Err(e) => {
                            tracing::warn!("{}, falling back to AI locate", e);
                            stale = true;
                        }
                    },
                    None => {
                        tracing::debug!("Negative locate record for \"{}\", asking the model", prompt)
                    }
                }
            }
        }

        let element = self.locate_one(param, context).await?;
        if let Some(cache) = cache {
            self.record_feature(cache, prompt, element.center, stale).await;
        }
        Ok(Resolution {
            element,
            hit_by: HitBy::new(HitSource::Ai, json!({ "prompt": prompt })),
        })
    }

    /// Ask the locate service, requiring exactly one match.
    async fn locate_one(
        &self,
        param: &LocateParam,
        context: &UiContext,
    ) -> Result<LocateResultElement, EngineError> {
        let mut found = self.locator.locate(param, context).await?;
        match found.len() {
            0 => Err(EngineError::NotFound(param.prompt.clone())),
            1 => {
                let element = found.remove(0);
                tracing::debug!("AI located \"{}\" at {:?}", param.prompt, element.center);
                Ok(match element.description {
                    Some(_) => element,
                    None => element.with_description(param.prompt.clone()),
                })
            }
            count => Err(EngineError::MultipleElementsFound {
                prompt: param.prompt.clone(),
                count,
            }),
        }
    }

    /// Re-find a cached descriptor on the live interface.
    async fn validate(
        &self,
        prompt: &str,
        feature: &ElementCacheFeature,
    ) -> Result<LocateResultElement, EngineError> {
        let failed = |reason: String| EngineError::CacheValidationFailed {
            prompt: prompt.to_string(),
            reason,
        };
        match self.device.rect_matches_cache_feature(feature).await {
            Ok(Some(rect)) => Ok(LocateResultElement::from_rect(rect).with_description(prompt)),
            Ok(None) => Err(failed("no element matches on the current interface".to_string())),
            Err(e) => Err(failed(e.to_string())),
        }
    }

    /// Extract and store a descriptor for `point`. Failures never fail the
    /// resolution. An empty descriptor is not written, except that a stale
    /// record is replaced by a negative one so its old values do not survive.
    async fn record_feature(&self, cache: &TaskCache, prompt: &str, point: Point, stale: bool) {
        let feature = match self.device.cache_feature_for_point(point).await {
            Ok(feature) => feature.filter(|feature| !feature.is_empty()),
            Err(e) => {
                tracing::warn!("Failed to extract cache feature for \"{}\": {}", prompt, e);
                None
            }
        };

        let write = match feature {
            Some(feature) => Some(Some(feature)),
            None if stale => Some(None),
            None => {
                tracing::debug!("Empty cache feature for \"{}\", skipping cache write", prompt);
                None
            }
        };

        if let Some(feature) = write {
            if let Err(e) = cache.write_locate_cache(prompt, feature) {
                tracing::warn!("Failed to write locate cache for \"{}\": {}", prompt, e);
            }
        }
    }
}

/// Task output for a resolved element.
pub fn resolution_output(resolution: &Resolution) -> Value {
    json!({ "element": resolution.element })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDevice, MockLocator};
    use crate::types::{Rect, Size};

    fn context() -> UiContext {
        UiContext::new(Size::new(1280.0, 720.0), "c2NyZWVu")
    }

    fn feature(xpath: &str) -> ElementCacheFeature {
        ElementCacheFeature::from_xpaths(vec![xpath.to_string()])
    }

    struct Fixture {
        device: Arc<MockDevice>,
        locator: Arc<MockLocator>,
        cache: Arc<TaskCache>,
        resolver: LocateResolver,
    }

    fn fixture() -> Fixture {
        let device = Arc::new(MockDevice::new());
        let locator = Arc::new(MockLocator::new());
        let cache = Arc::new(TaskCache::in_memory("resolver").unwrap());
        let resolver = LocateResolver::new(device.clone(), locator.clone(), Some(cache.clone()));
        Fixture {
            device,
            locator,
            cache,
            resolver,
        }
    }

    #[tokio::test]
    async fn test_bbox_skips_model_and_cache() {
        let f = fixture();
        f.device.set_feature(Some(feature("/html/body/button")));
        let param = LocateParam::new("OK").with_bbox([10.0, 10.0, 30.0, 30.0]);

        let resolution = f.resolver.resolve(&param, &context()).await.unwrap();
        assert_eq!(resolution.hit_by.from, HitSource::Plan);
        assert_eq!(resolution.element.center, (20.0, 20.0));
        assert_eq!(f.locator.calls(), 0);
        assert_eq!(f.device.validation_calls(), 0);
        assert!(f.cache.has_locate_record("OK"));
    }

    #[tokio::test]
    async fn test_bbox_hit_does_not_rewrite_existing_record() {
        let f = fixture();
        f.cache.write_locate_cache("OK", Some(feature("/kept"))).unwrap();
        f.device.set_feature(Some(feature("/new")));
        let param = LocateParam::new("OK").with_bbox([0.0, 0.0, 10.0, 10.0]);

        f.resolver.resolve(&param, &context()).await.unwrap();
        assert_eq!(f.device.feature_calls(), 0);
        let stored = f.cache.locate_record("OK").unwrap().cache.unwrap();
        assert_eq!(stored.xpaths.unwrap(), vec!["/kept".to_string()]);
    }

    #[tokio::test]
    async fn test_valid_cache_skips_model() {
        let f = fixture();
        f.cache.write_locate_cache("OK", Some(feature("/btn"))).unwrap();
        f.device.set_valid_xpath("/btn", Rect::new(100.0, 100.0, 40.0, 20.0));

        let resolution = f.resolver.resolve(&LocateParam::new("OK"), &context()).await.unwrap();
        assert_eq!(resolution.hit_by.from, HitSource::Cache);
        assert_eq!(resolution.element.center, (120.0, 110.0));
        assert_eq!(f.locator.calls(), 0);
    }

    #[tokio::test]
    async fn test_stale_cache_is_overwritten() {
        let f = fixture();
        f.cache
            .write_locate_cache(
                "OK",
                Some(ElementCacheFeature::from_xpaths(vec![
                    "/old/a".to_string(),
                    "/old/b".to_string(),
                ])),
            )
            .unwrap();
        f.device.fail_validation("element detached");
        f.device.set_feature(Some(feature("/new/a")));
        f.locator.respond_at("OK", (50.0, 60.0));

        let resolution = f.resolver.resolve(&LocateParam::new("OK"), &context()).await.unwrap();
        assert_eq!(resolution.hit_by.from, HitSource::Ai);
        assert_eq!(f.locator.calls(), 1);

        let stored = f.cache.locate_record("OK").unwrap().cache.unwrap();
        let xpaths = stored.xpaths.unwrap();
        assert_eq!(xpaths, vec!["/new/a".to_string()]);
        assert!(!xpaths.iter().any(|x| x.starts_with("/old")));
        assert_eq!(f.cache.records().len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_cache_falls_back_to_model() {
        let f = fixture();
        f.cache.write_locate_cache("OK", Some(feature("/gone"))).unwrap();
        f.locator.respond_at("OK", (5.0, 5.0));

        let resolution = f.resolver.resolve(&LocateParam::new("OK"), &context()).await.unwrap();
        assert_eq!(resolution.hit_by.from, HitSource::Ai);
        // Device yields no descriptor: the stale one is replaced by a negative record.
        assert!(f.cache.locate_record("OK").unwrap().cache.is_none());
    }

    #[tokio::test]
    async fn test_cacheable_false_never_touches_cache() {
        let f = fixture();
        f.cache.write_locate_cache("OK", Some(feature("/btn"))).unwrap();
        f.device.set_valid_xpath("/btn", Rect::new(0.0, 0.0, 10.0, 10.0));
        f.device.set_feature(Some(feature("/fresh")));
        f.locator.respond_at("OK", (5.0, 5.0));

        let param = LocateParam::new("OK").with_cacheable(false);
        let resolution = f.resolver.resolve(&param, &context()).await.unwrap();
        assert_eq!(resolution.hit_by.from, HitSource::Ai);
        assert_eq!(f.device.validation_calls(), 0);
        assert_eq!(f.device.feature_calls(), 0);
        let stored = f.cache.locate_record("OK").unwrap().cache.unwrap();
        assert_eq!(stored.xpaths.unwrap(), vec!["/btn".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_feature_not_written() {
        let f = fixture();
        f.device.set_feature(Some(ElementCacheFeature::default()));
        f.locator.respond_at("Search", (5.0, 5.0));

        f.resolver
            .resolve(&LocateParam::new("Search"), &context())
            .await
            .unwrap();
        assert!(!f.cache.has_locate_record("Search"));
    }

    #[tokio::test]
    async fn test_zero_and_multiple_matches() {
        let f = fixture();
        let missing = f.resolver.resolve(&LocateParam::new("Nothing"), &context()).await;
        assert!(matches!(missing, Err(EngineError::NotFound(_))));

        f.locator.respond(
            "Item",
            vec![
                LocateResultElement::at_point((1.0, 1.0)),
                LocateResultElement::at_point((2.0, 2.0)),
            ],
        );
        let ambiguous = f.resolver.resolve(&LocateParam::new("Item"), &context()).await;
        assert!(matches!(
            ambiguous,
            Err(EngineError::MultipleElementsFound { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_param_rejected() {
        let f = fixture();
        let result = f.resolver.resolve(&LocateParam::new("  "), &context()).await;
        assert!(matches!(result, Err(EngineError::InvalidParam(_))));
    }
}
